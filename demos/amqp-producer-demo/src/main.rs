use chrono::{DateTime, Utc};
use messaging_runtime::amqp::AmqpPublisher;
use messaging_runtime::config::{AmqpConfig, ExchangeConfig, ExchangeKind, QueueConfig};
use messaging_runtime::delivery::DeliveryMode;
use messaging_runtime::envelope::{Destination, MessageEnvelope};
use messaging_runtime::lifecycle::{Flushable, Lifecycle};
use serde::{Deserialize, Serialize};
use std::time::Duration;

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

    let publisher = AmqpPublisher::new(config, DeliveryMode::AtLeastOnce).await?;

    let message = ExampleMessage {
        id: 1,
        message: "Hello from the AMQP publisher!".to_string(),
        timestamp: Utc::now(),
    };
    let destination = Destination::exchange("example_exchange", "example.routing.key");
    let envelope = MessageEnvelope::new(destination, &message)?;
    publisher.publish(&envelope).await?;
    println!("Message published successfully!");

    let batch: Vec<MessageEnvelope> = (2..5)
        .map(|id| {
            let message = ExampleMessage {
                id,
                message: format!("Batched message {id}"),
                timestamp: Utc::now(),
            };
            MessageEnvelope::new(
                Destination::exchange("example_exchange", "example.routing.key"),
                &message,
            )
        })
        .collect::<Result<_, _>>()?;
    publisher.publish_batch(&batch).await?;
    println!("Batch of {} messages published successfully!", batch.len());

    publisher.flush(Duration::from_secs(5)).await?;

    if publisher.is_healthy() {
        println!("Publisher is still connected");
    } else {
        println!("Publisher connection is lost");
    }

    publisher.dispose().await?;
    Ok(())
}
