use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

pub const HEADER_CORRELATION_ID: &str = "correlation-id";
pub const HEADER_MESSAGE_ID: &str = "message-id";
pub const HEADER_ATTEMPT_COUNT: &str = "attempt-count";
pub const HEADER_ORIGIN_TS: &str = "origin-ts";
pub const HEADER_ORIGINAL_TARGET: &str = "x-original-target";
pub const HEADER_DEATH_REASON: &str = "x-death-reason";

/// Where an envelope is headed: a log-broker topic, or an AMQP
/// exchange/routing-key pair. Both are carried so the same envelope type
/// crosses either transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Topic name (log broker) or exchange name (AMQP).
    pub topic_or_exchange: String,
    /// AMQP routing key. Unused by the log broker.
    pub routing_key: Option<String>,
    /// Partition hint for the log broker. Unused by AMQP.
    pub key: Option<String>,
}

impl Destination {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            topic_or_exchange: name.into(),
            routing_key: None,
            key: None,
        }
    }

    pub fn topic_with_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            topic_or_exchange: name.into(),
            routing_key: None,
            key: Some(key.into()),
        }
    }

    pub fn exchange(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            topic_or_exchange: name.into(),
            routing_key: Some(routing_key.into()),
            key: None,
        }
    }
}

/// The wire-neutral record carrying payload bytes and headers between
/// domain code and whichever transport (log broker or AMQP) is configured.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub destination: Destination,
    pub value_bytes: Vec<u8>,
    /// Ordered, unique-keyed headers. ASCII key, opaque byte value.
    pub headers: BTreeMap<String, Vec<u8>>,
    /// Broker-assigned if left unset at publish time.
    pub timestamp: Option<i64>,
}

impl MessageEnvelope {
    /// Builds a new envelope, stamping `message-id`, `correlation-id`,
    /// `origin-ts`, and `attempt-count=0`.
    pub fn new(destination: Destination, payload: &impl Serialize) -> Result<Self, TransportError> {
        let value_bytes = serde_json::to_vec(payload)?;
        Ok(Self::from_bytes(destination, value_bytes))
    }

    /// Same as [`MessageEnvelope::new`] but takes pre-serialized bytes
    /// directly, for raw/opaque payloads.
    pub fn from_bytes(destination: Destination, value_bytes: Vec<u8>) -> Self {
        let message_id = Uuid::new_v4().to_string();
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_MESSAGE_ID.to_string(), message_id.clone().into_bytes());
        headers.insert(HEADER_CORRELATION_ID.to_string(), message_id.into_bytes());
        headers.insert(HEADER_ATTEMPT_COUNT.to_string(), b"0".to_vec());
        headers.insert(HEADER_ORIGIN_TS.to_string(), now_millis().to_string().into_bytes());

        Self {
            destination,
            value_bytes,
            headers,
            timestamp: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: Vec<u8>) -> Self {
        self.headers.insert(name.into(), value);
        self
    }

    pub fn header_str(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v).to_string())
    }

    pub fn message_id(&self) -> Option<String> {
        self.header_str(HEADER_MESSAGE_ID)
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.header_str(HEADER_CORRELATION_ID)
    }

    pub fn attempt_count(&self) -> u32 {
        self.header_str(HEADER_ATTEMPT_COUNT)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Assigns a deterministic `message-id` derived from a dedup key, so
    /// retries of the same logical send converge on one id. Used when the
    /// producer strategy enables `duplicateDetection`.
    pub fn with_deterministic_id(mut self, dedup_key: &str) -> Self {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, dedup_key.as_bytes()).to_string();
        self.headers
            .insert(HEADER_MESSAGE_ID.to_string(), id.as_bytes().to_vec());
        if !self.headers.contains_key(HEADER_CORRELATION_ID) {
            self.headers
                .insert(HEADER_CORRELATION_ID.to_string(), id.into_bytes());
        }
        self
    }

    /// Derives a new envelope for DLQ emission: same `message-id` and
    /// `correlation-id`, `attempt-count` bumped by `attempt_delta`.
    pub fn derive(&self, attempt_delta: u32) -> Self {
        let mut next = self.clone();
        let attempt = self.attempt_count().saturating_add(attempt_delta);
        next.headers
            .insert(HEADER_ATTEMPT_COUNT.to_string(), attempt.to_string().into_bytes());
        next
    }

    pub fn unmarshal_to<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.value_bytes).map_err(TransportError::from)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_else(|_| Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Payload {
        id: i32,
    }

    #[test]
    fn new_envelope_stamps_required_headers() {
        let env = MessageEnvelope::new(Destination::topic("orders"), &Payload { id: 7 }).unwrap();
        assert_eq!(env.attempt_count(), 0);
        assert_eq!(env.message_id(), env.correlation_id());
        assert!(env.header_str(HEADER_ORIGIN_TS).is_some());
    }

    #[test]
    fn derive_preserves_message_and_correlation_id_and_bumps_attempt() {
        let env = MessageEnvelope::new(Destination::topic("orders"), &Payload { id: 7 }).unwrap();
        let derived = env.derive(1);
        assert_eq!(derived.message_id(), env.message_id());
        assert_eq!(derived.correlation_id(), env.correlation_id());
        assert_eq!(derived.attempt_count(), 1);

        let derived_twice = derived.derive(1);
        assert_eq!(derived_twice.attempt_count(), 2);
        assert_eq!(derived_twice.message_id(), env.message_id());
    }

    #[test]
    fn deterministic_id_is_stable_across_calls() {
        let env1 = MessageEnvelope::new(Destination::topic("orders"), &Payload { id: 1 })
            .unwrap()
            .with_deterministic_id("order-42");
        let env2 = MessageEnvelope::new(Destination::topic("orders"), &Payload { id: 1 })
            .unwrap()
            .with_deterministic_id("order-42");
        assert_eq!(env1.message_id(), env2.message_id());
    }

    #[test]
    fn unmarshal_round_trips_payload() {
        let env = MessageEnvelope::new(Destination::topic("orders"), &Payload { id: 99 }).unwrap();
        let decoded: Payload = env.unmarshal_to().unwrap();
        assert_eq!(decoded.id, 99);
    }
}
