//! Wire protocol for execution sessions
//!
//! Every application message is a binary msgpack payload. A session accepts
//! one invocation request at a time, streams tagged output chunks back, and
//! finishes with exactly one `Done` report. The only control message a
//! client may send while an invocation runs is the `Kill` token.

use crate::report::ExecutionReport;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

/// Requests with a larger encoded size are rejected before decoding.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Upper bound on the payload of a single output chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Per-stream byte budget; output beyond it is truncated, not killed.
pub const STREAM_BUDGET: usize = 128 * 1024;

/// WebSocket close codes used for abnormal session endings.
pub mod close_code {
    /// A text frame arrived where a binary one was required.
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Malformed or semantically invalid request, or unexpected control data.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Request exceeded [`MAX_REQUEST_SIZE`](super::MAX_REQUEST_SIZE).
    pub const TOO_LARGE: u16 = 1009;
    /// The server failed in a way the client did not cause.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Which backend stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A piece of backend output, in production order within its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// Server-to-client messages.
///
/// Externally tagged, so `Stdout`/`Stderr` reach the wire as single-entry
/// maps and clients can dispatch on the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerMessage {
    /// A chunk of the program's standard output.
    Stdout(ByteBuf),
    /// A chunk of the program's standard error.
    Stderr(ByteBuf),
    /// Terminal report; sent exactly once per invocation.
    Done(ExecutionReport),
}

impl From<OutputChunk> for ServerMessage {
    fn from(chunk: OutputChunk) -> Self {
        let bytes = ByteBuf::from(chunk.bytes);
        match chunk.stream {
            StreamKind::Stdout => Self::Stdout(bytes),
            StreamKind::Stderr => Self::Stderr(bytes),
        }
    }
}

/// Client-to-server control messages, accepted only while a backend runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    /// Kill the running invocation's process group immediately.
    Kill,
}

/// Decoding failures for inbound messages.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{0}")]
    Malformed(#[from] rmp_serde::decode::Error),

    /// A complete message followed by trailing bytes.
    #[error("found extra data")]
    TrailingData,
}

/// Encode a message to msgpack with named fields and variants.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack, rejecting trailing bytes.
pub fn decode_exact<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
    let mut cursor = std::io::Cursor::new(data);
    let mut de = rmp_serde::Deserializer::new(&mut cursor);
    let value = T::deserialize(&mut de)?;
    drop(de);
    if cursor.position() < data.len() as u64 {
        return Err(DecodeError::TrailingData);
    }
    Ok(value)
}
