use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Destination, MessageEnvelope, HEADER_DEATH_REASON, HEADER_ORIGINAL_TARGET};
use crate::error::TransportResult;

/// Minimal publish surface a transport exposes to the dead-letter router.
/// Implemented by both the AMQP publisher (publishing to a DLX) and the
/// log-broker producer (publishing to a DLQ topic), so `DeadLetterRouter`
/// stays family-agnostic.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send_dead_letter(
        &self,
        destination: &Destination,
        envelope: &MessageEnvelope,
    ) -> TransportResult<()>;
}

/// Family-agnostic surface that producers/consumers call to route a failed
/// delivery to its configured dead-letter destination (spec.md §4.8).
pub struct DeadLetterRouter {
    destination: Destination,
    sink: Arc<dyn DeadLetterSink>,
}

impl DeadLetterRouter {
    pub fn new(destination: Destination, sink: Arc<dyn DeadLetterSink>) -> Self {
        Self { destination, sink }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Sets `x-original-target`, `x-death-reason`, increments
    /// `attempt-count`, and publishes to the configured DLQ destination.
    pub async fn emit_dead_letter(
        &self,
        origin: &Destination,
        envelope: &MessageEnvelope,
        cause: &str,
    ) -> TransportResult<()> {
        let dead_letter = envelope
            .derive(1)
            .with_header(
                HEADER_ORIGINAL_TARGET,
                origin.topic_or_exchange.clone().into_bytes(),
            )
            .with_header(HEADER_DEATH_REASON, cause.as_bytes().to_vec());

        self.sink.send_dead_letter(&self.destination, &dead_letter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::HEADER_ATTEMPT_COUNT;
    use std::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<MessageEnvelope>>,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn send_dead_letter(
            &self,
            _destination: &Destination,
            envelope: &MessageEnvelope,
        ) -> TransportResult<()> {
            self.received.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn emit_dead_letter_stamps_headers_and_preserves_ids() {
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(Vec::new()),
        });
        let router = DeadLetterRouter::new(Destination::topic("orders.dlq"), sink.clone());

        let origin = Destination::topic("orders");
        let original = MessageEnvelope::new(origin.clone(), &serde_json::json!({"id": 1})).unwrap();

        router
            .emit_dead_letter(&origin, &original, "boom")
            .await
            .unwrap();

        let received = sink.received.lock().unwrap();
        let dead_letter = &received[0];
        assert_eq!(dead_letter.message_id(), original.message_id());
        assert_eq!(dead_letter.correlation_id(), original.correlation_id());
        assert_eq!(dead_letter.attempt_count(), 1);
        assert_eq!(
            dead_letter.header_str(HEADER_ORIGINAL_TARGET),
            Some("orders".to_string())
        );
        assert_eq!(
            dead_letter.header_str(HEADER_DEATH_REASON),
            Some("boom".to_string())
        );
        assert_eq!(dead_letter.header_str(HEADER_ATTEMPT_COUNT), Some("1".to_string()));
    }
}
