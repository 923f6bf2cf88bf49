use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use futures_util::FutureExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::Notify;
use tokio::time::timeout;

use super::declare_topology;
use crate::config::AmqpConfig;
use crate::dlq::DeadLetterRouter;
use crate::envelope::{Destination, MessageEnvelope};
use crate::error::{TransportError, TransportResult};
use crate::lifecycle::Lifecycle;

/// What a handler decides to do with a delivered envelope. Spec.md's
/// REDESIGN FLAGS call for a result variant instead of throw-to-reject
/// control flow; a handler that panics is still honoured as `DeadLetter`
/// (see `process_one`) so the "throw ⇒ DLQ" contract in spec.md §4.7
/// survives for callers that port exception-based handlers verbatim.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Ack,
    Requeue,
    DeadLetter(String),
}

pub type Handler = Arc<dyn Fn(MessageEnvelope) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// N concurrent worker consumers over a queue, with prefetch control and
/// DLX-backed failure routing (spec.md §4.7).
pub struct AmqpSubscriber {
    connection: Connection,
    config: AmqpConfig,
    queue_name: String,
    disposed: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    drained: Arc<Notify>,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
}

impl AmqpSubscriber {
    pub async fn new(config: AmqpConfig, queue_name: impl Into<String>) -> TransportResult<Self> {
        let connection = timeout(
            Duration::from_secs(60),
            Connection::connect(&config.amqp_url(), ConnectionProperties::default()),
        )
        .await
        .map_err(|_| TransportError::Timeout("AMQP connection timeout".to_string()))?
        .map_err(TransportError::from)?;

        let bootstrap = connection.create_channel().await.map_err(TransportError::from)?;
        declare_topology(&bootstrap, &config).await?;
        bootstrap.close(200, "bootstrap channel closed").await.map_err(TransportError::from)?;

        Ok(Self {
            connection,
            config,
            queue_name: queue_name.into(),
            disposed: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(Notify::new()),
            in_flight: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    /// Opens `worker_count` channels, each at `basic.qos(prefetch)`, and
    /// starts a consumer on each against `queue_name`. Runs until
    /// `stop_async` is called.
    pub async fn start_async(
        &self,
        handler: Handler,
        dead_letter: Option<Arc<DeadLetterRouter>>,
    ) -> TransportResult<()> {
        for _ in 0..self.config.worker_count {
            let channel = self.connection.create_channel().await.map_err(TransportError::from)?;
            channel
                .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(TransportError::from)?;

            let consumer = channel
                .basic_consume(
                    &self.queue_name,
                    "",
                    BasicConsumeOptions {
                        no_ack: false,
                        exclusive: false,
                        no_local: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(TransportError::from)?;

            let handler = handler.clone();
            let dead_letter = dead_letter.clone();
            let stop_requested = self.stop_requested.clone();
            let drained = self.drained.clone();
            let in_flight = self.in_flight.clone();
            let queue_name = self.queue_name.clone();

            tokio::spawn(async move {
                let mut stream = consumer;
                while let Some(delivery_res) = stream.next().await {
                    if stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                    let delivery = match delivery_res {
                        Ok(d) => d,
                        Err(e) => {
                            log::error!("amqp subscriber delivery error on queue {}: {}", queue_name, e);
                            continue;
                        }
                    };

                    in_flight.fetch_add(1, Ordering::AcqRel);
                    process_one(&channel, delivery, &handler, dead_letter.as_deref(), &queue_name).await;
                    if in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                        drained.notify_waiters();
                    }
                }
            });
        }

        Ok(())
    }

    /// Cancels all consumers, drains in-flight handlers up to
    /// `config.unsubscribe_drain`, then closes channels.
    pub async fn stop_async(&self) -> TransportResult<()> {
        self.stop_requested.store(true, Ordering::Release);

        if self.in_flight.load(Ordering::Acquire) > 0 {
            let _ = timeout(self.config.unsubscribe_drain, self.drained.notified()).await;
        }

        Ok(())
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

async fn process_one(
    channel: &lapin::Channel,
    delivery: lapin::message::Delivery,
    handler: &Handler,
    dead_letter: Option<&DeadLetterRouter>,
    queue_name: &str,
) {
    let delivery_tag = delivery.delivery_tag;
    let envelope = envelope_from_delivery(&delivery, queue_name);

    let outcome = match AssertUnwindSafe(handler(envelope.clone())).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic);
            HandlerOutcome::DeadLetter(message)
        }
    };

    match outcome {
        HandlerOutcome::Ack => {
            if let Err(e) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                log::error!("amqp subscriber failed to ack delivery {}: {}", delivery_tag, e);
            }
        }
        HandlerOutcome::Requeue => {
            if let Err(e) = channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    },
                )
                .await
            {
                log::error!("amqp subscriber failed to nack (requeue) delivery {}: {}", delivery_tag, e);
            }
        }
        HandlerOutcome::DeadLetter(cause) => {
            if let Some(router) = dead_letter {
                let origin = Destination::exchange(envelope.destination.topic_or_exchange.clone(), "");
                if let Err(e) = router.emit_dead_letter(&origin, &envelope, &cause).await {
                    log::error!("amqp subscriber failed to emit dead letter: {}", e);
                }
            } else {
                log::warn!(
                    "amqp subscriber: handler requested dead-letter but no router configured, cause={}",
                    cause
                );
            }
            // Ack the original to prevent an infinite redelivery loop; the
            // failure now lives on the DLX instead.
            if let Err(e) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                log::error!("amqp subscriber failed to ack after dead-letter {}: {}", delivery_tag, e);
            }
        }
    }
}

fn envelope_from_delivery(delivery: &lapin::message::Delivery, queue_name: &str) -> MessageEnvelope {
    let mut headers = BTreeMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if let lapin::types::AMQPValue::LongString(s) = value {
                headers.insert(key.to_string(), s.as_bytes().to_vec());
            }
        }
    }

    MessageEnvelope {
        destination: Destination::exchange(delivery.exchange.to_string(), delivery.routing_key.to_string()),
        value_bytes: delivery.data.clone(),
        headers,
        timestamp: delivery.properties.timestamp().map(|t| t as i64),
    }
    .with_header("x-queue", queue_name.as_bytes().to_vec())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[async_trait]
impl Lifecycle for AmqpSubscriber {
    fn is_healthy(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && self.connection.status().connected()
    }

    async fn dispose(&self) -> TransportResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_async().await?;
        self.connection
            .close(200, "subscriber disposed")
            .await
            .map_err(TransportError::from)
    }
}
