//! Error types and result handling for wal2json-capture.
//!
//! This module defines the main error type [`Error`], the replication
//! protocol taxonomy [`ProtocolError`], and a convenience [`Result`]
//! type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use wal2json_capture::{Error, ProtocolError, Result};
//!
//! fn read_chunk() -> Result<()> {
//!     Err(ProtocolError::EmptyChunk.into())
//! }
//!
//! match read_chunk() {
//!     Ok(()) => println!("decoded"),
//!     Err(Error::Protocol(ProtocolError::EmptyChunk)) => eprintln!("blank chunk"),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// A violation of the wal2json chunked wire format.
///
/// Every variant is fatal to the current replication session: the decoder
/// state machine cannot resume reassembly from an inconsistent position, so
/// the caller must tear down the stream and reconnect with a fresh
/// [`StreamingDecoder`](crate::postgres::StreamingDecoder).
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A chunk contained no non-whitespace byte where one was required.
    #[error("chunk contains no non-whitespace bytes")]
    EmptyChunk,

    /// The transaction envelope lacked a required field, or the field had
    /// the wrong shape (e.g. an unparseable commit timestamp).
    #[error("transaction envelope is missing or has malformed field `{field}`")]
    MissingEnvelopeField {
        /// Name of the offending envelope field
        field: &'static str,
    },

    /// A chunk inside a transaction began with a byte other than
    /// `{`, `,` or `]`.
    #[error("chunk arrived in unexpected state: leading byte `{0}`")]
    UnexpectedLeadingByte(char),

    /// The (possibly repaired) chunk content was rejected as invalid JSON,
    /// or the change document did not match the expected shape.
    #[error("malformed change document: {0}")]
    MalformedDocument(#[source] serde_json::Error),
}

/// The main error type for wal2json-capture operations.
///
/// This enum represents all possible errors that can occur during
/// replication, from configuration issues to runtime failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error from the config file or environment overlay.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding outbound messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from checkpoint file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Replication-stream error outside the decoder itself.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// wal2json wire-format violation; always fatal to the session.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the replication loop.
    #[error("Shutdown requested")]
    Shutdown,
}

/// A convenient Result type alias for wal2json-capture operations.
///
/// This is equivalent to `std::result::Result<T, wal2json_capture::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
