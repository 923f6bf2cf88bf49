pub mod publisher;
pub mod subscriber;

pub use publisher::AmqpPublisher;
pub use subscriber::{AmqpSubscriber, HandlerOutcome};

use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::Channel;

use crate::config::{AmqpConfig, ExchangeConfig, QueueConfig};
use crate::error::TransportResult;

/// Declares every configured exchange, queue, and the binding each queue
/// needs per its exchange's kind (spec.md §4.6 step 5). Idempotent: both
/// the publisher and a standalone subscriber call this so either can run
/// against an empty broker.
pub(crate) async fn declare_topology(channel: &Channel, config: &AmqpConfig) -> TransportResult<()> {
    for (name, exchange) in &config.exchanges {
        declare_exchange(channel, name, exchange).await?;
    }

    if let Some(dlx) = &config.dead_letter_exchange {
        declare_exchange(
            channel,
            dlx,
            &ExchangeConfig {
                kind: crate::config::ExchangeKind::Fanout,
                durable: true,
                auto_delete: false,
            },
        )
        .await?;
    }

    for (name, queue) in &config.queues {
        declare_queue(channel, name, queue, config.dead_letter_exchange.as_deref()).await?;
    }

    for queue_name in config.queues.keys() {
        for (exchange_name, exchange) in &config.exchanges {
            let routing_key = exchange.kind.default_binding_routing_key(queue_name);
            channel
                .queue_bind(
                    queue_name,
                    exchange_name,
                    &routing_key,
                    lapin::options::QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
    }

    Ok(())
}

async fn declare_exchange(channel: &Channel, name: &str, cfg: &ExchangeConfig) -> TransportResult<()> {
    channel
        .exchange_declare(
            name,
            cfg.kind.to_lapin(),
            ExchangeDeclareOptions {
                durable: cfg.durable,
                auto_delete: cfg.auto_delete,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

async fn declare_queue(
    channel: &Channel,
    name: &str,
    cfg: &QueueConfig,
    dead_letter_exchange: Option<&str>,
) -> TransportResult<()> {
    let mut args = FieldTable::default();
    if let Some(dlx) = dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            lapin::types::AMQPValue::LongString(dlx.into()),
        );
    }

    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: cfg.durable,
                exclusive: cfg.exclusive,
                auto_delete: cfg.auto_delete,
                nowait: false,
                passive: false,
            },
            args,
        )
        .await?;
    Ok(())
}
