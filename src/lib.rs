pub mod checkpoint;
pub mod config;
pub mod error;
pub mod replicator;

pub mod kafka;
pub mod postgres;

pub use config::Config;
pub use error::{Error, ProtocolError, Result};
pub use postgres::{ReplicationMessage, StreamingDecoder};
pub use replicator::Replicator;
