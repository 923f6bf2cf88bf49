use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as RdProducer};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::util::Timeout as RdTimeout;
use tokio::sync::Mutex;

use crate::config::LogProducerConfig;
use crate::delivery::{Acks, BrokerFamily, DeliveryStrategy, ProducerTunables, Role};
use crate::dlq::DeadLetterSink;
use crate::envelope::{Destination, MessageEnvelope};
use crate::error::{TransportError, TransportResult};
use crate::lifecycle::{Flushable, Lifecycle};

/// Single/batch/all-async producer over the partitioned log broker, with
/// idempotence, flush, and health (spec.md §4.4).
pub struct LogBrokerProducer {
    producer: FutureProducer,
    config: LogProducerConfig,
    tunables: ProducerTunables,
    transaction_open: Mutex<bool>,
    disposed: AtomicBool,
}

impl LogBrokerProducer {
    pub async fn new(config: LogProducerConfig) -> TransportResult<Self> {
        let strategy = DeliveryStrategy::resolve(BrokerFamily::LogBroker, config.semantic, Role::Producer)?;
        let tunables = *strategy.as_producer().expect("producer role resolves producer tunables");

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", acks_str(tunables.acks))
            .set("enable.idempotence", tunables.idempotent.to_string())
            .set("linger.ms", config.linger.as_millis().to_string())
            .set("batch.size", config.batch_bytes.to_string())
            .set(
                "queue.buffering.max.messages",
                config.queue_buffering_max_messages.to_string(),
            )
            .set(
                "max.in.flight.requests.per.connection",
                tunables.max_in_flight.to_string(),
            );

        if let Some(retries) = tunables.retries {
            client_config.set("retries", retries.to_string());
        } else {
            client_config.set("retries", i32::MAX.to_string());
        }

        if tunables.tx_enabled {
            let transactional_id = config
                .transactional_id
                .clone()
                .unwrap_or_else(|| format!("{}-tx", config.name));
            client_config.set("transactional.id", transactional_id);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

        if tunables.tx_enabled {
            let p = producer.clone();
            tokio::task::spawn_blocking(move || p.init_transactions(RdTimeout::After(Duration::from_secs(30))))
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?
                .map_err(TransportError::from)?;
        }

        Ok(Self {
            producer,
            config,
            tunables,
            transaction_open: Mutex::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn ensure_transaction_open(&self) -> TransportResult<()> {
        if !self.tunables.tx_enabled {
            return Ok(());
        }
        let mut open = self.transaction_open.lock().await;
        if !*open {
            let p = self.producer.clone();
            tokio::task::spawn_blocking(move || p.begin_transaction())
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?
                .map_err(TransportError::from)?;
            *open = true;
        }
        Ok(())
    }

    /// Stamps `message-id`/`correlation-id`/`attempt-count` and sends,
    /// preserving ordering per `key` only (spec.md §4.4 step 2). When
    /// `duplicate_detection` is on, the `message-id` is derived
    /// deterministically from the destination key (or the payload hash) so
    /// republishing the same envelope produces the same id (spec.md §4.4,
    /// §8 scenario 2).
    pub async fn publish(&self, envelope: &MessageEnvelope) -> TransportResult<()> {
        self.check_open()?;
        self.ensure_transaction_open().await?;

        let deduped;
        let envelope = if self.config.duplicate_detection {
            deduped = envelope.clone().with_deterministic_id(&duplicate_detection_key(envelope));
            &deduped
        } else {
            envelope
        };

        let mut headers = rdkafka::message::OwnedHeaders::new();
        for (name, value) in &envelope.headers {
            headers = headers.insert(rdkafka::message::Header {
                key: name.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let key = envelope.destination.key.clone().unwrap_or_default();
        let mut record = FutureRecord::to(&envelope.destination.topic_or_exchange)
            .payload(&envelope.value_bytes)
            .headers(headers);
        if !key.is_empty() {
            record = record.key(&key);
        }

        self.producer
            .send(record, Duration::from_secs(0))
            .await
            .map_err(|(err, _owned_message)| TransportError::from(err))?;
        Ok(())
    }

    /// Sends each envelope sequentially to preserve key order (spec.md
    /// §4.4's `PublishAll`).
    pub async fn publish_all(&self, envelopes: &[MessageEnvelope]) -> TransportResult<()> {
        for envelope in envelopes {
            self.publish(envelope).await?;
        }
        Ok(())
    }

    /// Semantically identical to `publish_all` from the caller's view; the
    /// underlying client batches sends sharing a destination automatically
    /// via `linger.ms`/`batch.size`, so this amortizes the network round
    /// trip without changing ordering guarantees.
    pub async fn publish_batch(&self, envelopes: &[MessageEnvelope]) -> TransportResult<()> {
        self.publish_all(envelopes).await
    }

    pub fn topics(&self) -> HashSet<String> {
        self.config.topics.iter().cloned().collect()
    }

    /// Bridges a consumer's offset commit into this producer's own
    /// transaction and commits it, so the output message(s) already sent on
    /// this transaction and the input offset become visible atomically
    /// (spec.md §4.5 step 3: "both visible or both absent"). Requires
    /// exactly-once to be enabled for this producer.
    pub async fn commit_offsets_in_transaction(
        &self,
        group_metadata: ConsumerGroupMetadata,
        offsets: &TopicPartitionList,
    ) -> TransportResult<()> {
        if !self.tunables.tx_enabled {
            return Err(TransportError::ConfigurationError(
                "commit_offsets_in_transaction requires an exactly-once producer".to_string(),
            ));
        }
        self.ensure_transaction_open().await?;

        let p = self.producer.clone();
        let offsets = offsets.clone();
        tokio::task::spawn_blocking(move || {
            p.send_offsets_to_transaction(&offsets, &group_metadata, RdTimeout::After(Duration::from_secs(30)))
        })
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?
        .map_err(TransportError::from)?;

        self.commit_if_transactional().await
    }

    /// Commits the open transaction (if exactly-once), matching spec.md
    /// §4.4 step 4.
    async fn commit_if_transactional(&self) -> TransportResult<()> {
        if !self.tunables.tx_enabled {
            return Ok(());
        }
        let mut open = self.transaction_open.lock().await;
        if *open {
            let p = self.producer.clone();
            tokio::task::spawn_blocking(move || p.commit_transaction(RdTimeout::After(Duration::from_secs(30))))
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?
                .map_err(TransportError::from)?;
            *open = false;
        }
        Ok(())
    }
}

fn acks_str(acks: Acks) -> &'static str {
    match acks {
        Acks::None => "0",
        Acks::Leader => "1",
        Acks::All => "all",
    }
}

/// Dedup key for `with_deterministic_id`: the caller-provided destination
/// key if present, else a hash of the payload bytes.
fn duplicate_detection_key(envelope: &MessageEnvelope) -> String {
    match &envelope.destination.key {
        Some(key) if !key.is_empty() => key.clone(),
        _ => payload_hash_hex(&envelope.value_bytes),
    }
}

/// `DefaultHasher::new()` uses fixed keys, so this is stable across
/// process restarts, unlike `HashMap`'s default `RandomState`.
fn payload_hash_hex(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl DeadLetterSink for LogBrokerProducer {
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
impl Lifecycle for LogBrokerProducer {
    fn is_healthy(&self) -> bool {
        !self.disposed.load(Ordering::Acquire)
    }

    /// Idempotent. A dispose without a prior flush aborts any open
    /// transaction (spec.md §4.4 step 4).
    async fn dispose(&self) -> TransportResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut open = self.transaction_open.lock().await;
        if *open {
            let p = self.producer.clone();
            let _ = tokio::task::spawn_blocking(move || {
                p.abort_transaction(RdTimeout::After(Duration::from_secs(30)))
            })
            .await;
            *open = false;
        }
        Ok(())
    }
}

#[async_trait]
impl Flushable for LogBrokerProducer {
    /// Blocks until the in-flight buffer is empty or `timeout` elapses;
    /// commits the open transaction first when exactly-once is enabled.
    async fn flush(&self, timeout: Duration) -> TransportResult<usize> {
        self.commit_if_transactional().await?;
        let in_flight_before = self.producer.in_flight_count();
        let p = self.producer.clone();
        tokio::task::spawn_blocking(move || p.flush(RdTimeout::After(timeout)))
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .map_err(TransportError::from)?;
        Ok(in_flight_before.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Destination;

    #[test]
    fn duplicate_detection_key_prefers_destination_key() {
        let envelope = MessageEnvelope::new(Destination::topic_with_key("orders", "order-42"), &"body").unwrap();
        assert_eq!(duplicate_detection_key(&envelope), "order-42");
    }

    #[test]
    fn duplicate_detection_key_falls_back_to_payload_hash() {
        let envelope = MessageEnvelope::new(Destination::topic("orders"), &"same payload").unwrap();
        let other = MessageEnvelope::new(Destination::topic("orders"), &"same payload").unwrap();
        assert_eq!(duplicate_detection_key(&envelope), duplicate_detection_key(&other));

        let different = MessageEnvelope::new(Destination::topic("orders"), &"different payload").unwrap();
        assert_ne!(duplicate_detection_key(&envelope), duplicate_detection_key(&different));
    }

    #[test]
    fn payload_hash_hex_is_deterministic_across_hashers() {
        assert_eq!(payload_hash_hex(b"abc"), payload_hash_hex(b"abc"));
        assert_ne!(payload_hash_hex(b"abc"), payload_hash_hex(b"abd"));
    }
}

