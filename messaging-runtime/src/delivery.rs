use crate::error::TransportError;

/// Broker family a `DeliveryStrategy` is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerFamily {
    LogBroker,
    Amqp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acks {
    None,
    Leader,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAfter {
    BeforeHandler,
    AfterHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
}

/// Producer-side tunables, a subset of which applies per broker family.
#[derive(Debug, Clone, Copy)]
pub struct ProducerTunables {
    pub acks: Acks,
    pub idempotent: bool,
    /// `None` means unbounded (capped internally by the transport).
    pub retries: Option<u32>,
    pub max_in_flight: u8,
    pub tx_enabled: bool,
    pub persistent: bool,
    pub publisher_confirms: bool,
}

/// Consumer-side tunables.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerTunables {
    pub auto_commit: bool,
    pub commit_after: CommitAfter,
    pub isolation_level: IsolationLevel,
    pub prefetch: u16,
    pub auto_ack: bool,
}

const LOG_AT_MOST_ONCE_PRODUCER: ProducerTunables = ProducerTunables {
    acks: Acks::None,
    idempotent: false,
    retries: Some(0),
    max_in_flight: 1,
    tx_enabled: false,
    persistent: false,
    publisher_confirms: false,
};

const LOG_AT_MOST_ONCE_CONSUMER: ConsumerTunables = ConsumerTunables {
    auto_commit: true,
    commit_after: CommitAfter::BeforeHandler,
    isolation_level: IsolationLevel::ReadUncommitted,
    prefetch: 500,
    auto_ack: true,
};

const LOG_AT_LEAST_ONCE_PRODUCER: ProducerTunables = ProducerTunables {
    acks: Acks::All,
    idempotent: false,
    retries: None,
    max_in_flight: 5,
    tx_enabled: false,
    persistent: false,
    publisher_confirms: false,
};

const LOG_AT_LEAST_ONCE_CONSUMER: ConsumerTunables = ConsumerTunables {
    auto_commit: false,
    commit_after: CommitAfter::AfterHandler,
    isolation_level: IsolationLevel::ReadUncommitted,
    prefetch: 500,
    auto_ack: false,
};

const LOG_EXACTLY_ONCE_PRODUCER: ProducerTunables = ProducerTunables {
    acks: Acks::All,
    idempotent: true,
    retries: None,
    max_in_flight: 1,
    tx_enabled: true,
    persistent: false,
    publisher_confirms: false,
};

const LOG_EXACTLY_ONCE_CONSUMER: ConsumerTunables = ConsumerTunables {
    auto_commit: false,
    commit_after: CommitAfter::AfterHandler,
    isolation_level: IsolationLevel::ReadCommitted,
    prefetch: 500,
    auto_ack: false,
};

const AMQP_AT_MOST_ONCE_PRODUCER: ProducerTunables = ProducerTunables {
    acks: Acks::None,
    idempotent: false,
    retries: Some(0),
    max_in_flight: 1,
    tx_enabled: false,
    persistent: false,
    publisher_confirms: false,
};

const AMQP_AT_LEAST_ONCE_PRODUCER: ProducerTunables = ProducerTunables {
    acks: Acks::All,
    idempotent: false,
    retries: Some(5),
    max_in_flight: 1,
    tx_enabled: false,
    persistent: true,
    publisher_confirms: true,
};

const AMQP_AT_LEAST_ONCE_CONSUMER: ConsumerTunables = ConsumerTunables {
    auto_commit: false,
    commit_after: CommitAfter::AfterHandler,
    isolation_level: IsolationLevel::ReadUncommitted,
    prefetch: 10,
    auto_ack: false,
};

const AMQP_AT_MOST_ONCE_CONSUMER: ConsumerTunables = ConsumerTunables {
    auto_commit: true,
    commit_after: CommitAfter::BeforeHandler,
    isolation_level: IsolationLevel::ReadUncommitted,
    prefetch: 10,
    auto_ack: true,
};

/// A pure configuration mapper from `(family, mode, role)` to the tunables
/// table in spec.md §4.3. Construction never touches the network.
#[derive(Debug, Clone, Copy)]
pub enum DeliveryStrategy {
    Producer(ProducerTunables),
    Consumer(ConsumerTunables),
}

impl DeliveryStrategy {
    pub fn resolve(
        family: BrokerFamily,
        mode: DeliveryMode,
        role: Role,
    ) -> Result<Self, TransportError> {
        use BrokerFamily::*;
        use DeliveryMode::*;
        use Role::*;

        match (family, mode, role) {
            (LogBroker, AtMostOnce, Producer) => Ok(Self::Producer(LOG_AT_MOST_ONCE_PRODUCER)),
            (LogBroker, AtMostOnce, Consumer) => Ok(Self::Consumer(LOG_AT_MOST_ONCE_CONSUMER)),
            (LogBroker, AtLeastOnce, Producer) => Ok(Self::Producer(LOG_AT_LEAST_ONCE_PRODUCER)),
            (LogBroker, AtLeastOnce, Consumer) => Ok(Self::Consumer(LOG_AT_LEAST_ONCE_CONSUMER)),
            (LogBroker, ExactlyOnce, Producer) => Ok(Self::Producer(LOG_EXACTLY_ONCE_PRODUCER)),
            (LogBroker, ExactlyOnce, Consumer) => Ok(Self::Consumer(LOG_EXACTLY_ONCE_CONSUMER)),

            (Amqp, AtMostOnce, Producer) => Ok(Self::Producer(AMQP_AT_MOST_ONCE_PRODUCER)),
            (Amqp, AtMostOnce, Consumer) => Ok(Self::Consumer(AMQP_AT_MOST_ONCE_CONSUMER)),
            (Amqp, AtLeastOnce, Producer) => Ok(Self::Producer(AMQP_AT_LEAST_ONCE_PRODUCER)),
            (Amqp, AtLeastOnce, Consumer) => Ok(Self::Consumer(AMQP_AT_LEAST_ONCE_CONSUMER)),

            (Amqp, ExactlyOnce, _) => Err(TransportError::ConfigurationError(
                "ExactlyOnce is not offered on AMQP: select AtLeastOnce with publisher confirms instead"
                    .to_string(),
            )),
        }
    }

    pub fn as_producer(&self) -> Option<&ProducerTunables> {
        match self {
            Self::Producer(t) => Some(t),
            Self::Consumer(_) => None,
        }
    }

    pub fn as_consumer(&self) -> Option<&ConsumerTunables> {
        match self {
            Self::Consumer(t) => Some(t),
            Self::Producer(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amqp_exactly_once_is_a_configuration_error() {
        let err = DeliveryStrategy::resolve(BrokerFamily::Amqp, DeliveryMode::ExactlyOnce, Role::Producer)
            .unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[test]
    fn log_exactly_once_producer_enables_idempotence_and_transactions() {
        let strategy =
            DeliveryStrategy::resolve(BrokerFamily::LogBroker, DeliveryMode::ExactlyOnce, Role::Producer)
                .unwrap();
        let tunables = strategy.as_producer().unwrap();
        assert!(tunables.idempotent);
        assert!(tunables.tx_enabled);
        assert_eq!(tunables.max_in_flight, 1);
    }

    #[test]
    fn log_at_most_once_consumer_commits_before_handler() {
        let strategy =
            DeliveryStrategy::resolve(BrokerFamily::LogBroker, DeliveryMode::AtMostOnce, Role::Consumer)
                .unwrap();
        let tunables = strategy.as_consumer().unwrap();
        assert!(tunables.auto_commit);
        assert_eq!(tunables.commit_after, CommitAfter::BeforeHandler);
    }

    #[test]
    fn amqp_at_least_once_producer_requires_confirms_and_persistence() {
        let strategy =
            DeliveryStrategy::resolve(BrokerFamily::Amqp, DeliveryMode::AtLeastOnce, Role::Producer)
                .unwrap();
        let tunables = strategy.as_producer().unwrap();
        assert!(tunables.publisher_confirms);
        assert!(tunables.persistent);
    }
}
