//! Streaming reassembly of wal2json chunked output.
//!
//! With `write-in-chunks` enabled the plugin delivers one transaction as a
//! sequence of buffers that are not chunked on JSON boundaries:
//!
//! - the transaction header, cut off right after the opening of its
//!   `"change": [` array,
//! - the first change object,
//! - further change objects, each with a leading `,`,
//! - a closing `]` `}` fragment.
//!
//! Each buffer has to be repaired in place (appending or blanking single
//! bytes) before it parses as standalone JSON. A change object can only be
//! handed downstream once the next buffer's leading byte proves it is
//! complete, so exactly one unflushed change is buffered at any time; decoder
//! memory stays O(1) no matter how many rows a transaction touches.

use serde_json::Value;
use tracing::trace;

use super::document::{self, NumberMode};
use super::message::ReplicationMessage;
use super::types::TransactionEnvelope;
use crate::error::ProtocolError;
use crate::Result;

const TAB: u8 = 9;
const CR: u8 = 13;
const SPACE: u8 = 32;

const COMMA: u8 = b',';
const RIGHT_BRACKET: u8 = b']';
const LEFT_BRACE: u8 = b'{';
const RIGHT_BRACE: u8 = b'}';

/// Downstream consumer of reassembled messages.
///
/// Invoked synchronously from [`StreamingDecoder::submit`]; a failure here
/// propagates back through `submit` and ends the replication session. Any
/// closure `FnMut(ReplicationMessage) -> Result<()>` qualifies.
pub trait ReplicationMessageProcessor {
    fn process(&mut self, message: ReplicationMessage) -> Result<()>;
}

impl<F> ReplicationMessageProcessor for F
where
    F: FnMut(ReplicationMessage) -> Result<()>,
{
    fn process(&mut self, message: ReplicationMessage) -> Result<()> {
        self(message)
    }
}

/// Reassembly position within the wire stream.
///
/// `pending` can only exist inside `Open`, so a non-empty buffer while idle
/// is unrepresentable.
#[derive(Debug)]
pub enum DecoderState {
    /// Between transactions; the next chunk is a transaction header.
    Idle,
    /// Inside a transaction's change list.
    Open {
        envelope: TransactionEnvelope,
        /// The last change chunk, held until the next chunk's leading byte
        /// confirms whether it was the final one.
        pending: Option<Vec<u8>>,
    },
}

/// The chunk-reassembly state machine.
///
/// One instance per replication session, driven by a single caller; a
/// [`ProtocolError`] leaves the decoder unusable and the session must be
/// torn down and restarted with a fresh instance.
pub struct StreamingDecoder {
    state: DecoderState,
    contains_metadata: bool,
}

impl StreamingDecoder {
    /// `contains_metadata` must match whether the slot was opened with
    /// `include-not-null`.
    pub fn new(contains_metadata: bool) -> Self {
        Self {
            state: DecoderState::Idle,
            contains_metadata,
        }
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Consumes one chunk, handing any completed change to `processor`.
    ///
    /// Chunk boundaries are chosen by the server, not by this decoder; the
    /// chunk may be an arbitrary fragment of the transaction document.
    pub fn submit<P: ReplicationMessageProcessor>(
        &mut self,
        chunk: &[u8],
        processor: &mut P,
    ) -> Result<()> {
        // Copy with two spare trailing bytes so repair characters can be
        // written without touching caller-owned memory.
        let mut content = Vec::with_capacity(chunk.len() + 2);
        content.extend_from_slice(chunk);
        content.push(SPACE);
        content.push(SPACE);

        trace!(
            chunk = %String::from_utf8_lossy(&content),
            "chunk arrived from database"
        );

        match std::mem::replace(&mut self.state, DecoderState::Idle) {
            DecoderState::Idle => self.begin_transaction(content, processor),
            DecoderState::Open { envelope, pending } => {
                self.continue_transaction(envelope, pending, content, processor)
            }
        }
    }

    fn begin_transaction<P: ReplicationMessageProcessor>(
        &mut self,
        mut content: Vec<u8>,
        processor: &mut P,
    ) -> Result<()> {
        if last_non_whitespace(&content).ok_or(ProtocolError::EmptyChunk)? != RIGHT_BRACE {
            // Chunked delivery truncates the header right after the opening
            // of the change array; close it so the header parses.
            let last = content.len() - 1;
            content[last - 1] = RIGHT_BRACKET;
            content[last] = RIGHT_BRACE;

            let header = document::read(&content, NumberMode::Native)?;
            let envelope = TransactionEnvelope::from_document(&header)?;
            self.state = DecoderState::Open {
                envelope,
                pending: None,
            };
            return Ok(());
        }

        // The buffer already ends in `}`: a self-closed transaction document
        // with no further chunks coming (an empty transaction, or one small
        // enough to fit a single buffer). Emit its changes and stay idle.
        let doc = document::read(&content, NumberMode::FloatsAsText)?;
        let envelope = TransactionEnvelope::from_document(&doc)?;
        let changes = match doc.get("change").and_then(Value::as_array) {
            Some(changes) => changes,
            None => return Ok(()),
        };
        let count = changes.len();
        for (index, change) in changes.iter().enumerate() {
            let message = ReplicationMessage::build(
                envelope.clone(),
                change.clone(),
                self.contains_metadata,
                index + 1 == count,
            )?;
            processor.process(message)?;
        }
        Ok(())
    }

    fn continue_transaction<P: ReplicationMessageProcessor>(
        &mut self,
        envelope: TransactionEnvelope,
        pending: Option<Vec<u8>>,
        mut content: Vec<u8>,
        processor: &mut P,
    ) -> Result<()> {
        let (first_pos, first) =
            first_non_whitespace(&content).ok_or(ProtocolError::EmptyChunk)?;

        match first {
            LEFT_BRACE => {
                // First change of the transaction; not known to be complete
                // until the next chunk's boundary byte arrives.
                self.state = DecoderState::Open {
                    envelope,
                    pending: Some(content),
                };
            }
            COMMA => {
                // A later change: the previous one is now proven complete.
                if let Some(buffered) = pending {
                    self.flush(&envelope, &buffered, false, processor)?;
                }
                content[first_pos] = SPACE;
                self.state = DecoderState::Open {
                    envelope,
                    pending: Some(content),
                };
            }
            RIGHT_BRACKET => {
                // End of the change list.
                if let Some(buffered) = pending {
                    self.flush(&envelope, &buffered, true, processor)?;
                }
            }
            other => {
                return Err(ProtocolError::UnexpectedLeadingByte(other as char).into());
            }
        }
        Ok(())
    }

    /// Parses a buffered change and hands it downstream.
    ///
    /// Floats-as-text mode keeps `numeric` column values at their exact
    /// wire representation.
    fn flush<P: ReplicationMessageProcessor>(
        &self,
        envelope: &TransactionEnvelope,
        buffered: &[u8],
        last_in_transaction: bool,
        processor: &mut P,
    ) -> Result<()> {
        let change = document::read(buffered, NumberMode::FloatsAsText)?;
        trace!(%change, "change arrived for decoding");

        let message = ReplicationMessage::build(
            envelope.clone(),
            change,
            self.contains_metadata,
            last_in_transaction,
        )?;
        processor.process(message)
    }
}

fn is_whitespace(c: u8) -> bool {
    (TAB..=CR).contains(&c) || c == SPACE
}

fn last_non_whitespace(content: &[u8]) -> Option<u8> {
    content.iter().rev().copied().find(|&c| !is_whitespace(c))
}

fn first_non_whitespace(content: &[u8]) -> Option<(usize, u8)> {
    content
        .iter()
        .copied()
        .enumerate()
        .find(|&(_, c)| !is_whitespace(c))
}
