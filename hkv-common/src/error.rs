//! # Shared Error Types
//!
//! Errors raised by the shared HybridKV types. Client-side transport and
//! framing errors live in `hkv-client`; this crate only reports problems with
//! values constructed from caller input.

use thiserror::Error;

/// Result alias for fallible `hkv-common` constructors.
pub type HkvResult<T> = Result<T, HkvError>;

/// Errors produced by shared HybridKV types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HkvError {
    /// A literal token exceeded `MAX_LITERAL_SIZE`.
    #[error("literal of {len} bytes exceeds the inline literal capacity")]
    LiteralTooLong { len: usize },
}
