pub mod connection;
pub mod decoder;
pub mod document;
pub mod message;
pub mod snapshot;
pub mod types;


pub use connection::{ReplicationConnection, ReplicationFrame, SystemInfo};
pub use decoder::{DecoderState, ReplicationMessageProcessor, StreamingDecoder};
pub use message::ReplicationMessage;
pub use snapshot::{OffsetState, SnapshotMode};
pub use types::*;
