use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;

use super::declare_topology;
use crate::config::AmqpConfig;
use crate::delivery::{BrokerFamily, DeliveryMode, DeliveryStrategy, Role};
use crate::dlq::DeadLetterSink;
use crate::envelope::{Destination, MessageEnvelope};
use crate::error::{TransportError, TransportResult};
use crate::lifecycle::{Flushable, Lifecycle};

/// Bounded pool of leased AMQP channels, one TCP connection shared across
/// `channels_per_connection` channels. Generalizes the teacher's single
/// fixed `Channel` field in `rustlib/rabbitmq::Subscriber` into a pool so
/// concurrent publishers don't serialize on one channel.
struct ChannelPool {
    channels: Mutex<Vec<Channel>>,
    permits: Semaphore,
}

impl ChannelPool {
    async fn acquire(&self) -> TransportResult<Channel> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;
        let mut guard = self.channels.lock().await;
        guard.pop().ok_or(TransportError::Closed)
    }

    async fn release(&self, channel: Channel) {
        self.channels.lock().await.push(channel);
        self.permits.add_permits(1);
    }
}

/// Channel/connection pool, exchange/queue/binding bootstrap, single and
/// batch publish, and DLX routing over AMQP 0-9-1 (spec.md §4.6).
pub struct AmqpPublisher {
    connection: Connection,
    config: AmqpConfig,
    pool: Arc<ChannelPool>,
    publisher_confirms: bool,
    persistent: bool,
    disposed: AtomicBool,
}

impl AmqpPublisher {
    pub async fn new(config: AmqpConfig, mode: DeliveryMode) -> TransportResult<Self> {
        let strategy = DeliveryStrategy::resolve(BrokerFamily::Amqp, mode, Role::Producer)?;
        let tunables = strategy.as_producer().expect("producer role resolves producer tunables");

        let connection = timeout(
            Duration::from_secs(60),
            Connection::connect(&config.amqp_url(), ConnectionProperties::default()),
        )
        .await
        .map_err(|_| TransportError::Timeout("AMQP connection timeout".to_string()))?
        .map_err(TransportError::from)?;

        let mut channels = Vec::with_capacity(config.channels_per_connection);
        for _ in 0..config.channels_per_connection {
            let channel = connection.create_channel().await.map_err(TransportError::from)?;
            if tunables.publisher_confirms {
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(TransportError::from)?;
            }
            channels.push(channel);
        }

        // Bootstrap topology using a borrowed channel; it gets pushed back below.
        if let Some(bootstrap) = channels.first() {
            declare_topology(bootstrap, &config).await?;
        }

        let permits = channels.len();
        Ok(Self {
            connection,
            config,
            pool: Arc::new(ChannelPool {
                channels: Mutex::new(channels),
                permits: Semaphore::new(permits),
            }),
            publisher_confirms: tunables.publisher_confirms,
            persistent: tunables.persistent,
            disposed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn properties(&self, envelope: &MessageEnvelope) -> BasicProperties {
        let mut fields = FieldTable::default();
        for (key, value) in &envelope.headers {
            fields.insert(key.as_str().into(), AMQPValue::LongString(value.clone().into()));
        }

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_headers(fields)
            .with_delivery_mode(if self.persistent { 2 } else { 1 });

        if let Some(ts) = envelope.timestamp {
            properties = properties.with_timestamp(ts as u64);
        }
        properties
    }

    /// Acquires a channel, publishes, waits for broker confirm if
    /// configured, and returns the channel to the pool.
    pub async fn publish(&self, envelope: &MessageEnvelope) -> TransportResult<()> {
        self.check_open()?;
        let channel = self.pool.acquire().await?;
        let result = self.publish_on(&channel, envelope).await;
        self.pool.release(channel).await;
        result
    }

    async fn publish_on(&self, channel: &Channel, envelope: &MessageEnvelope) -> TransportResult<()> {
        let routing_key = envelope.destination.routing_key.as_deref().unwrap_or("");
        let confirm = channel
            .basic_publish(
                &envelope.destination.topic_or_exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.value_bytes,
                self.properties(envelope),
            )
            .await
            .map_err(TransportError::from)?;

        if self.publisher_confirms {
            confirm.await.map_err(TransportError::from)?;
        }
        Ok(())
    }

    /// Sends each envelope sequentially to preserve per-routing-key order,
    /// aggregating the first error encountered.
    pub async fn publish_all(&self, envelopes: &[MessageEnvelope]) -> TransportResult<()> {
        for envelope in envelopes {
            self.publish(envelope).await?;
        }
        Ok(())
    }

    /// Acquires one channel, publishes every envelope on it, flushes
    /// confirms once, then releases. Semantically identical to
    /// `publish_all` but amortizes channel acquisition.
    pub async fn publish_batch(&self, envelopes: &[MessageEnvelope]) -> TransportResult<()> {
        self.check_open()?;
        if envelopes.is_empty() {
            return Ok(());
        }

        let channel = self.pool.acquire().await?;
        let mut pending = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let routing_key = envelope.destination.routing_key.as_deref().unwrap_or("");
            let confirm = channel
                .basic_publish(
                    &envelope.destination.topic_or_exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &envelope.value_bytes,
                    self.properties(envelope),
                )
                .await
                .map_err(TransportError::from);
            pending.push(confirm);
        }

        let mut first_err = None;
        if self.publisher_confirms {
            for confirm in pending {
                match confirm {
                    Ok(c) => {
                        if let Err(e) = c.await.map_err(TransportError::from) {
                            first_err.get_or_insert(e);
                        }
                    }
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
        } else {
            for confirm in pending {
                if let Err(e) = confirm {
                    first_err.get_or_insert(e);
                }
            }
        }

        self.pool.release(channel).await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Publishes the envelope (with `attempt-count` bumped and death
    /// headers set) to the configured dead-letter exchange.
    pub async fn publish_to_dead_letter(
        &self,
        destination: &Destination,
        envelope: &MessageEnvelope,
        cause: &str,
    ) -> TransportResult<()> {
        use crate::envelope::{HEADER_DEATH_REASON, HEADER_ORIGINAL_TARGET};

        let dead_letter = envelope
            .derive(1)
            .with_header(
                HEADER_ORIGINAL_TARGET,
                envelope.destination.topic_or_exchange.clone().into_bytes(),
            )
            .with_header(HEADER_DEATH_REASON, cause.as_bytes().to_vec());

        let mut routed = dead_letter;
        routed.destination = destination.clone();
        self.publish(&routed).await
    }

    pub fn topics(&self) -> Vec<String> {
        self.config.exchanges.keys().cloned().collect()
    }
}

#[async_trait]
impl DeadLetterSink for AmqpPublisher {
    async fn send_dead_letter(
        &self,
        destination: &Destination,
        envelope: &MessageEnvelope,
    ) -> TransportResult<()> {
        let mut routed = envelope.clone();
        routed.destination = destination.clone();
        self.publish(&routed).await
    }
}

#[async_trait]
impl Lifecycle for AmqpPublisher {
    fn is_healthy(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && self.connection.status().connected()
    }

    /// Idempotent. Closes every pooled channel and the underlying
    /// connection; subsequent operations fail with `TransportError::Closed`.
    async fn dispose(&self) -> TransportResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channels = self.pool.channels.lock().await;
        for channel in channels.iter() {
            let _ = channel.close(200, "publisher disposed").await;
        }
        self.connection.close(200, "publisher disposed").await.map_err(TransportError::from)
    }
}

#[async_trait]
impl Flushable for AmqpPublisher {
    /// Blocks until all outstanding confirms arrive or `timeout` elapses.
    async fn flush(&self, deadline: Duration) -> TransportResult<usize> {
        let started = Instant::now();
        let mut flushed = 0;
        let channels = self.pool.channels.lock().await;
        for channel in channels.iter() {
            if started.elapsed() >= deadline {
                break;
            }
            let remaining = deadline.saturating_sub(started.elapsed());
            if timeout(remaining, channel.wait_for_confirms()).await.is_ok() {
                flushed += 1;
            }
        }
        Ok(flushed)
    }
}

