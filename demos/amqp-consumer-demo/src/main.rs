use chrono::{DateTime, Utc};
use messaging_runtime::amqp::{AmqpSubscriber, HandlerOutcome};
use messaging_runtime::config::{AmqpConfig, ExchangeConfig, ExchangeKind, QueueConfig};
use messaging_runtime::envelope::MessageEnvelope;
use messaging_runtime::lifecycle::Lifecycle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug)]
struct ExampleMessage {
    id: i32,
    message: String,
    timestamp: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = AmqpConfig::from_env("EXAMPLE_AMQP")
        .with_exchange(
            "example_exchange",
            ExchangeConfig {
                kind: ExchangeKind::Topic,
                durable: true,
                auto_delete: false,
            },
        )
        .with_queue(
            "example_queue",
            QueueConfig {
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
        );

    let subscriber = AmqpSubscriber::new(config, "example_queue").await?;

    let handler = Arc::new(|envelope: MessageEnvelope| {
        Box::pin(async move {
            match envelope.unmarshal_to::<ExampleMessage>() {
                Ok(message) => {
                    println!(
                        "Received message: ID={}, Message={}, Time={}",
                        message.id,
                        message.message,
                        message.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ")
                    );
                    HandlerOutcome::Ack
                }
                Err(e) => HandlerOutcome::DeadLetter(e.to_string()),
            }
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = HandlerOutcome> + Send>>
    });

    subscriber.start_async(handler, None).await?;

    println!("Subscriber started on queue: {}", subscriber.queue_name());
    println!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    subscriber.dispose().await?;
    Ok(())
}
