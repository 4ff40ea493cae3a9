//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and incrementally parse server replies out
//! of segmented receive buffers, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `parse_reply` either consumes one complete
//!    reply or leaves the cursor exactly where it was.
//! 2. **Buffer Reuse**: Commands are encoded into a caller-owned `BytesMut`.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes and handed out
//!    as `Bytes` slices of the receive buffer.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{BufMut, Bytes, BytesMut};

use hkv_common::{reply_status, server_error_kind, ReplyStatus, ServerErrorKind};

use crate::error::FrameError;
use crate::frame_reader::{BufferSlice, CrlfStatus, FrameReader};

/// Default maximum bulk string length (512 MiB, the RESP2 limit).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Default maximum number of elements in one array reply.
pub const DEFAULT_MAX_ARRAY_LEN: usize = 1 << 20;

/// Default maximum length of a header or inline line without a terminator.
pub const DEFAULT_MAX_INLINE_LEN: usize = 64 * 1024;

/// Nested arrays deeper than this are rejected.
const MAX_NESTING_DEPTH: usize = 32;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Bytes),
    /// -ERR ... responses.
    Error(Bytes),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Bytes>),
    /// *... arrays; null and empty arrays are both empty.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Classifies a simple-string reply (`OK`, `PONG`, `QUEUED`).
    pub fn status(&self) -> Option<ReplyStatus> {
        match self {
            RespValue::Simple(text) => reply_status(text),
            _ => None,
        }
    }

    /// Classifies an error reply by its prefix.
    pub fn error_kind(&self) -> Option<ServerErrorKind> {
        match self {
            RespValue::Error(message) => Some(server_error_kind(message)),
            _ => None,
        }
    }
}

/// Size limits applied while parsing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Largest accepted bulk string payload.
    pub max_bulk_len: usize,
    /// Largest accepted array element count.
    pub max_array_len: usize,
    /// Longest line accepted while still waiting for its terminator.
    pub max_inline_len: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        ParseLimits {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            max_inline_len: DEFAULT_MAX_INLINE_LEN,
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut BytesMut) {
    let payload: usize = args.iter().map(|arg| arg.len() + 16).sum();
    out.reserve(payload + 16);

    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Parses one reply from the reader.
///
/// Returns `Ok(None)` when the buffered bytes end before the reply does; the
/// reader is then unchanged and the call can be retried once more bytes
/// arrive. On `Ok(Some(_))` the reader sits just past the reply.
///
/// # Errors
/// Any `FrameError` means the stream is desynchronized and the connection
/// must be dropped.
pub fn parse_reply(
    reader: &mut FrameReader<'_>,
    limits: &ParseLimits,
) -> Result<Option<RespValue>, FrameError> {
    let mut probe = reader.snapshot();
    match parse_value(&mut probe, limits, 0)? {
        Some(value) => {
            *reader = probe;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_value(
    reader: &mut FrameReader<'_>,
    limits: &ParseLimits,
    depth: usize,
) -> Result<Option<RespValue>, FrameError> {
    let (kind, body) = match read_line(reader, limits)? {
        Some(line) => line,
        None => return Ok(None),
    };

    match kind {
        b'+' => Ok(Some(RespValue::Simple(body.into_bytes()))),
        b'-' => Ok(Some(RespValue::Error(body.into_bytes()))),
        b':' => Ok(Some(RespValue::Integer(parse_i64(&body)?))),
        b'$' => {
            let len = parse_i64(&body)?;
            parse_bulk_len(reader, len, limits)
        }
        b'*' => {
            let len = parse_i64(&body)?;
            parse_array_len(reader, len, limits, depth)
        }
        _ => Err(FrameError::Malformed("unknown reply type")),
    }
}

fn parse_bulk_len(
    reader: &mut FrameReader<'_>,
    len: i64,
    limits: &ParseLimits,
) -> Result<Option<RespValue>, FrameError> {
    if len < 0 {
        return Ok(Some(RespValue::Bulk(None)));
    }
    let len = len as usize;
    if len > limits.max_bulk_len {
        return Err(FrameError::TooLarge { len, limit: limits.max_bulk_len });
    }
    if reader.remaining() < len + 2 {
        return Ok(None);
    }

    let data = reader.consume_as_buffer(len)?;
    match reader.try_consume_crlf() {
        CrlfStatus::Success => Ok(Some(RespValue::Bulk(Some(data.into_bytes())))),
        CrlfStatus::Failure => Err(FrameError::Malformed("bulk string missing terminator")),
        CrlfStatus::NeedMoreData => Ok(None),
    }
}

fn parse_array_len(
    reader: &mut FrameReader<'_>,
    len: i64,
    limits: &ParseLimits,
    depth: usize,
) -> Result<Option<RespValue>, FrameError> {
    if len <= 0 {
        return Ok(Some(RespValue::Array(Vec::new())));
    }
    let len = len as usize;
    if len > limits.max_array_len {
        return Err(FrameError::TooLarge { len, limit: limits.max_array_len });
    }
    if depth >= MAX_NESTING_DEPTH {
        return Err(FrameError::Malformed("arrays nested too deeply"));
    }

    // Each element needs at least 3 bytes, so never reserve past that.
    let mut items = Vec::with_capacity(len.min(reader.remaining() / 3 + 1));
    for _ in 0..len {
        match parse_value(reader, limits, depth + 1)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(RespValue::Array(items)))
}

/// Reads `<type><body>\r\n`, returning the type byte and the body.
fn read_line(
    reader: &mut FrameReader<'_>,
    limits: &ParseLimits,
) -> Result<Option<(u8, BufferSlice)>, FrameError> {
    let len = match reader.find_next_crlf() {
        Some(len) => len,
        None if reader.remaining() > limits.max_inline_len => {
            return Err(FrameError::TooLarge {
                len: reader.remaining(),
                limit: limits.max_inline_len,
            });
        }
        None => return Ok(None),
    };
    let kind = match reader.consume_byte() {
        Some(b'\r') | None => return Err(FrameError::Malformed("empty line")),
        Some(kind) => kind,
    };
    let body = reader.consume_as_buffer(len - 1)?;
    match reader.try_consume_crlf() {
        CrlfStatus::Success => Ok(Some((kind, body))),
        _ => Err(FrameError::Malformed("line terminator mismatch")),
    }
}

fn parse_i64(digits: &BufferSlice) -> Result<i64, FrameError> {
    let mut bytes = digits.parts().flat_map(|part| part.iter().copied()).peekable();
    let negative = bytes.next_if_eq(&b'-').is_some();
    if bytes.peek().is_none() {
        return Err(FrameError::Malformed("empty integer"));
    }

    // Negative values accumulate downwards so `i64::MIN` fits.
    let mut value: i64 = 0;
    for b in bytes {
        if !b.is_ascii_digit() {
            return Err(FrameError::Malformed("invalid integer"));
        }
        let digit = (b - b'0') as i64;
        value = value
            .checked_mul(10)
            .and_then(|v| {
                if negative {
                    v.checked_sub(digit)
                } else {
                    v.checked_add(digit)
                }
            })
            .ok_or(FrameError::Malformed("integer overflow"))?;
    }
    Ok(value)
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}
