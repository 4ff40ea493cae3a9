//! Error types for hkv-client.
//!
//! Frame and gate errors are raised by the low-level building blocks;
//! `ClientError` is what callers of the multiplexer and `KVClient` see.

use std::io;

use bytes::Bytes;
use thiserror::Error;

use hkv_common::ServerErrorKind;

use crate::write_gate::TicketState;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Hard framing faults. Any of these desynchronizes the connection.
///
/// "Need more data" is not an error and never appears here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A definite-length consume asked for more bytes than are buffered.
    #[error("frame truncated: wanted {wanted} bytes, {available} buffered")]
    Truncated { wanted: usize, available: usize },
    /// Bytes are present but do not form a valid RESP2 frame.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// A declared length exceeds the configured limit.
    #[error("declared length {len} exceeds limit {limit}")]
    TooLarge { len: usize, limit: usize },
}

/// Write gate usage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// A pending ticket already has a continuation.
    #[error("a continuation is already registered for this ticket")]
    ContinuationAlreadyRegistered,
    /// The ticket does not own the gate.
    #[error("ticket is {0:?} and does not hold the gate")]
    NotHeld(TicketState),
    /// The ticket was issued by another gate.
    #[error("ticket was issued by a different gate")]
    ForeignTicket,
}

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { kind: ServerErrorKind, message: Bytes },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,
    /// The write gate was not granted within the configured timeout.
    #[error("timed out waiting for the connection write path")]
    WriteTimeout,
    /// The write gate acquisition was canceled.
    #[error("operation canceled")]
    Canceled,
    /// The connection is gone; the request may or may not have been sent.
    #[error("connection closed")]
    ConnectionClosed,
}
