pub mod key_strategy;
pub mod producer;
pub mod serializer;

pub use key_strategy::KeyStrategy;
pub use producer::KafkaProducer;
pub use serializer::JsonSerializer;
