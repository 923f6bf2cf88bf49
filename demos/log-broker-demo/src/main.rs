use chrono::{DateTime, Utc};
use messaging_runtime::config::{LogConsumerConfig, LogProducerConfig};
use messaging_runtime::delivery::DeliveryMode;
use messaging_runtime::envelope::{Destination, MessageEnvelope};
use messaging_runtime::lifecycle::{Flushable, Lifecycle};
use messaging_runtime::log_broker::consumer::HandlerOutcome;
use messaging_runtime::log_broker::{LogBrokerConsumer, LogBrokerProducer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug)]
struct ExampleMessage {
    id: i32,
    message: String,
    timestamp: DateTime<Utc>,
}

/// Standalone demo of both sides of the log-broker transport. Run with
/// `produce` or `consume` as the first argument against a broker reachable
/// at `EXAMPLE_LOG_BOOTSTRAP_SERVERS` (default `localhost:9092`).
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "produce".to_string());
    match mode.as_str() {
        "consume" => run_consumer().await,
        _ => run_producer().await,
    }
}

async fn run_producer() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = LogProducerConfig::from_env("EXAMPLE_LOG");
    config.topics = vec!["example.topic".to_string()];
    config.semantic = DeliveryMode::AtLeastOnce;

    let producer = LogBrokerProducer::new(config).await?;

    let message = ExampleMessage {
        id: 1,
        message: "Hello from the log-broker producer!".to_string(),
        timestamp: Utc::now(),
    };
    let envelope = MessageEnvelope::new(Destination::topic_with_key("example.topic", "k1"), &message)?;
    producer.publish(&envelope).await?;
    println!("Message published to {:?}!", producer.topics());

    producer.flush(Duration::from_secs(5)).await?;
    producer.dispose().await?;
    Ok(())
}

async fn run_consumer() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = LogConsumerConfig::from_env("EXAMPLE_LOG");
    config.topics = vec!["example.topic".to_string()];

    let consumer = LogBrokerConsumer::new(config)?;

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

    consumer.start_async(handler, None, None)?;

    println!("Consumer started on topics: {:?}", consumer.topics());
    println!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    consumer.dispose().await?;
    Ok(())
}
