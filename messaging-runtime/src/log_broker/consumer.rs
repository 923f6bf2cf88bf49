use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use futures_util::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerGroupMetadata, StreamConsumer};
use rdkafka::message::{Headers, Message};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::config::LogConsumerConfig;
use crate::delivery::{BrokerFamily, CommitAfter, ConsumerTunables, DeliveryStrategy, IsolationLevel, Role};
use crate::dlq::DeadLetterRouter;
use crate::envelope::{Destination, MessageEnvelope};
use crate::error::{TransportError, TransportResult};
use crate::lifecycle::Lifecycle;
use crate::log_broker::producer::LogBrokerProducer;

pub use crate::amqp::HandlerOutcome;

pub type Handler = Arc<dyn Fn(MessageEnvelope) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// Subscription over the partitioned log broker: per-partition ordering,
/// configurable commit-before/after-handler strategy, and DLQ routing on
/// handler failure (spec.md §4.5).
pub struct LogBrokerConsumer {
    consumer: Arc<StreamConsumer>,
    config: LogConsumerConfig,
    tunables: ConsumerTunables,
    stop_requested: Arc<AtomicBool>,
    drained: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
    disposed: AtomicBool,
}

impl LogBrokerConsumer {
    pub fn new(config: LogConsumerConfig) -> TransportResult<Self> {
        let strategy = DeliveryStrategy::resolve(BrokerFamily::LogBroker, config.semantic, Role::Consumer)?;
        let tunables = *strategy.as_consumer().expect("consumer role resolves consumer tunables");

        let isolation_level = match resolve_isolation_level(tunables.isolation_level, config.isolation_level) {
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::ReadUncommitted => "read_uncommitted",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", tunables.auto_commit.to_string())
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("isolation.level", isolation_level)
            .set("session.timeout.ms", config.session_timeout.as_millis().to_string())
            .create()
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(TransportError::from)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            config,
            tunables,
            stop_requested: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(Notify::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Consumer group metadata, needed by a producer's
    /// `send_offsets_to_transaction` when co-processing an exactly-once
    /// consume-transform-produce pipeline (spec.md §4.5 step 5).
    pub fn group_metadata(&self) -> Option<ConsumerGroupMetadata> {
        self.consumer.group_metadata()
    }

    /// Spawns the read loop. Runs until `stop_async` is called.
    ///
    /// `transactional_producer` bridges exactly-once consumption into a
    /// producer's own Kafka transaction (spec.md §4.5 step 3): instead of
    /// committing this consumer's offset independently, the offset is
    /// folded into the producer's transaction via
    /// `send_offsets_to_transaction`, so the output record(s) already sent
    /// on that transaction and the input offset commit become visible
    /// atomically. Required when `semantic` is `ExactlyOnce`; fails fast
    /// otherwise.
    pub fn start_async(
        &self,
        handler: Handler,
        dead_letter: Option<Arc<DeadLetterRouter>>,
        transactional_producer: Option<Arc<LogBrokerProducer>>,
    ) -> TransportResult<()> {
        if self.config.semantic == crate::delivery::DeliveryMode::ExactlyOnce && transactional_producer.is_none() {
            return Err(TransportError::ConfigurationError(
                "exactly-once log-broker consumption requires a transactional producer".to_string(),
            ));
        }

        let consumer = self.consumer.clone();
        let stop_requested = self.stop_requested.clone();
        let drained = self.drained.clone();
        let in_flight = self.in_flight.clone();
        let commit_after = self.tunables.commit_after;
        let group_id = self.config.group_id.clone();

        tokio::spawn(async move {
            let mut stream = consumer.stream();
            while let Some(message_res) = stream.next().await {
                if stop_requested.load(Ordering::Acquire) {
                    break;
                }
                let borrowed = match message_res {
                    Ok(m) => m,
                    Err(e) => {
                        log::error!("log broker consumer {} read error: {}", group_id, e);
                        continue;
                    }
                };

                let envelope = envelope_from_message(&borrowed);

                if commit_after == CommitAfter::BeforeHandler {
                    if let Err(e) = consumer.commit_message(&borrowed, CommitMode::Sync) {
                        log::error!("log broker consumer {} commit-before-handler failed: {}", group_id, e);
                    }
                }

                in_flight.fetch_add(1, Ordering::AcqRel);
                let outcome = match std::panic::AssertUnwindSafe(handler(envelope.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(panic) => HandlerOutcome::DeadLetter(panic_message(panic)),
                };

                match outcome {
                    HandlerOutcome::Ack => {
                        if commit_after == CommitAfter::AfterHandler {
                            if let Some(producer) = transactional_producer.as_deref() {
                                if let Err(e) = commit_via_transaction(&consumer, producer, &borrowed).await {
                                    log::error!(
                                        "log broker consumer {} transactional offset commit failed: {}",
                                        group_id, e
                                    );
                                }
                            } else if let Err(e) = consumer.commit_message(&borrowed, CommitMode::Sync) {
                                log::error!("log broker consumer {} commit-after-handler failed: {}", group_id, e);
                            }
                        }
                    }
                    HandlerOutcome::Requeue => {
                        // Offset stays uncommitted; the record replays after
                        // a restart or rebalance instead of being skipped.
                    }
                    HandlerOutcome::DeadLetter(cause) => {
                        if let Some(router) = dead_letter.as_deref() {
                            let origin = Destination::topic(envelope.destination.topic_or_exchange.clone());
                            if let Err(e) = router.emit_dead_letter(&origin, &envelope, &cause).await {
                                log::error!("log broker consumer {} failed to emit dead letter: {}", group_id, e);
                            }
                        } else {
                            log::warn!(
                                "log broker consumer {}: handler requested dead-letter but no router configured, cause={}",
                                group_id, cause
                            );
                        }
                        if let Err(e) = consumer.commit_message(&borrowed, CommitMode::Sync) {
                            log::error!("log broker consumer {} commit after dead-letter failed: {}", group_id, e);
                        }
                    }
                }

                if in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    drained.notify_waiters();
                }
            }
        });

        Ok(())
    }

    /// Stops the read loop and waits up to `config.graceful_drain` for the
    /// in-flight handler to finish (spec.md §5 graceful shutdown).
    pub async fn stop_async(&self) -> TransportResult<()> {
        self.stop_requested.store(true, Ordering::Release);
        if self.in_flight.load(Ordering::Acquire) > 0 {
            let _ = timeout(self.config.graceful_drain, self.drained.notified()).await;
        }
        Ok(())
    }

    pub fn topics(&self) -> &[String] {
        &self.config.topics
    }

    /// Pauses/resumes consumption of every assigned partition without
    /// leaving the group, used by `stop_async` callers that want to drain
    /// without triggering a rebalance.
    pub fn pause(&self) -> TransportResult<()> {
        let assignment = self.consumer.assignment().map_err(TransportError::from)?;
        self.consumer.pause(&assignment).map_err(TransportError::from)
    }

    pub fn resume(&self) -> TransportResult<()> {
        let assignment = self.consumer.assignment().map_err(TransportError::from)?;
        self.consumer.resume(&assignment).map_err(TransportError::from)
    }
}

/// Combines the delivery-strategy's required isolation level with the
/// config's explicit override. The override can only tighten
/// (`ReadUncommitted` → `ReadCommitted`), never loosen a strategy that
/// already requires `ReadCommitted` (e.g. exactly-once).
fn resolve_isolation_level(tunables: IsolationLevel, config_override: IsolationLevel) -> IsolationLevel {
    if tunables == IsolationLevel::ReadCommitted || config_override == IsolationLevel::ReadCommitted {
        IsolationLevel::ReadCommitted
    } else {
        IsolationLevel::ReadUncommitted
    }
}

/// Folds this message's offset into `producer`'s open transaction instead
/// of committing it on the consumer directly (spec.md §4.5 step 3).
async fn commit_via_transaction(
    consumer: &StreamConsumer,
    producer: &LogBrokerProducer,
    message: &rdkafka::message::BorrowedMessage<'_>,
) -> TransportResult<()> {
    let group_metadata = consumer
        .group_metadata()
        .ok_or_else(|| TransportError::ConfigurationError("consumer has no group metadata".to_string()))?;

    let mut offsets = rdkafka::topic_partition_list::TopicPartitionList::new();
    offsets.add_partition_offset(
        message.topic(),
        message.partition(),
        rdkafka::Offset::Offset(message.offset() + 1),
    )?;

    producer.commit_offsets_in_transaction(group_metadata, &offsets).await
}

fn envelope_from_message(message: &rdkafka::message::BorrowedMessage<'_>) -> MessageEnvelope {
    let mut headers = BTreeMap::new();
    if let Some(table) = message.headers() {
        for header in table.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    MessageEnvelope {
        destination: Destination {
            topic_or_exchange: message.topic().to_string(),
            routing_key: None,
            key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        },
        value_bytes: message.payload().unwrap_or_default().to_vec(),
        headers,
        timestamp: message.timestamp().to_millis(),
    }
    .with_header("x-partition", message.partition().to_string().into_bytes())
    .with_header("x-offset", message.offset().to_string().into_bytes())
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

#[async_trait::async_trait]
impl Lifecycle for LogBrokerConsumer {
    fn is_healthy(&self) -> bool {
        !self.disposed.load(Ordering::Acquire)
    }

    async fn dispose(&self) -> TransportResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_async().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_isolation_level_tightens_but_never_loosens() {
        assert_eq!(
            resolve_isolation_level(IsolationLevel::ReadUncommitted, IsolationLevel::ReadUncommitted),
            IsolationLevel::ReadUncommitted
        );
        assert_eq!(
            resolve_isolation_level(IsolationLevel::ReadUncommitted, IsolationLevel::ReadCommitted),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            resolve_isolation_level(IsolationLevel::ReadCommitted, IsolationLevel::ReadUncommitted),
            IsolationLevel::ReadCommitted
        );
    }
}
