use thiserror::Error;

/// Error taxonomy shared by every transport and the cache facade.
///
/// Variants are kinds, not per-backend wire errors: callers match on these
/// to decide retry/DLQ/propagate behaviour without caring whether the
/// underlying transport was `lapin`, `rdkafka`, or `redis`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport operation timed out: {0}")]
    Timeout(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handler failure: {0}")]
    HandlerFailure(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("operation attempted after disposal")]
    Closed,

    #[error("key not found")]
    NotFound,
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(_) => TransportError::Unavailable(err.to_string()),
            other => TransportError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<rdkafka::error::KafkaError> for TransportError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError as E;
        match &err {
            E::MessageProduction(code) | E::MessageConsumption(code) => {
                if is_retriable(*code) {
                    TransportError::Unavailable(err.to_string())
                } else {
                    TransportError::ProtocolViolation(err.to_string())
                }
            }
            _ => TransportError::ProtocolViolation(err.to_string()),
        }
    }
}

fn is_retriable(code: rdkafka::types::RDKafkaErrorCode) -> bool {
    use rdkafka::types::RDKafkaErrorCode as C;
    matches!(
        code,
        C::BrokerTransportFailure
            | C::AllBrokersDown
            | C::NotCoordinator
            | C::RequestTimedOut
    )
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connection_dropped() || err.is_connection_refusal() {
            TransportError::Unavailable(err.to_string())
        } else {
            TransportError::ProtocolViolation(err.to_string())
        }
    }
}
