pub mod consumer;
pub mod producer;

pub use consumer::LogBrokerConsumer;
pub use producer::LogBrokerProducer;
