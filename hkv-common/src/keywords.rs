//! # Protocol Keywords
//!
//! Purpose: Name the fixed RESP2 words HybridKV clients need to recognize:
//! simple-string status words, error-reply prefixes, and command names.
//!
//! ## Usage Notes
//!
//! - Tables are built once on first use and shared process-wide.
//! - Lookups are case-insensitive and never allocate.
//! - Unknown words map to `None` (or `ServerErrorKind::Other`) rather than an
//!   error: the server may grow new keywords.

use std::sync::LazyLock;

use crate::literal::{LiteralMatcher, ShortLiteral};

/// Well-known simple-string replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// `+OK`
    Ok,
    /// `+PONG`
    Pong,
    /// `+QUEUED` inside a transaction.
    Queued,
}

/// Error reply classes, keyed by the first word of the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    /// `ERR` generic failure.
    Generic,
    /// `WRONGTYPE` operation against a key holding the wrong kind of value.
    WrongType,
    /// `MOVED` slot redirect.
    Moved,
    /// `ASK` one-shot slot redirect.
    Ask,
    /// `LOADING` dataset still loading.
    Loading,
    /// `NOAUTH` authentication required.
    NoAuth,
    /// `BUSY` server busy running a script.
    Busy,
    /// `READONLY` write against a replica.
    ReadOnly,
    /// `NOSCRIPT` unknown script digest.
    NoScript,
    /// `EXECABORT` transaction discarded.
    ExecAbort,
    /// Any prefix not listed above.
    Other,
}

/// Commands the HybridKV client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Get,
    Set,
    Del,
    Expire,
    Ttl,
    Info,
}

impl Command {
    /// All commands, in declaration order.
    pub const ALL: [Command; 7] = [
        Command::Ping,
        Command::Get,
        Command::Set,
        Command::Del,
        Command::Expire,
        Command::Ttl,
        Command::Info,
    ];

    /// Returns the canonical upper-case literal for this command.
    pub const fn literal(self) -> ShortLiteral {
        match self {
            Command::Ping => ShortLiteral::from_static("PING"),
            Command::Get => ShortLiteral::from_static("GET"),
            Command::Set => ShortLiteral::from_static("SET"),
            Command::Del => ShortLiteral::from_static("DEL"),
            Command::Expire => ShortLiteral::from_static("EXPIRE"),
            Command::Ttl => ShortLiteral::from_static("TTL"),
            Command::Info => ShortLiteral::from_static("INFO"),
        }
    }

    /// Returns the wire name of this command.
    pub const fn name(self) -> &'static [u8] {
        match self {
            Command::Ping => b"PING",
            Command::Get => b"GET",
            Command::Set => b"SET",
            Command::Del => b"DEL",
            Command::Expire => b"EXPIRE",
            Command::Ttl => b"TTL",
            Command::Info => b"INFO",
        }
    }

    /// Recognizes a command name, ignoring ASCII case.
    pub fn lookup(name: &[u8]) -> Option<Command> {
        COMMANDS.get(name).copied()
    }
}

static COMMANDS: LazyLock<LiteralMatcher<Command>> = LazyLock::new(|| {
    Command::ALL
        .iter()
        .map(|command| (command.literal(), *command))
        .collect()
});

static STATUSES: LazyLock<LiteralMatcher<ReplyStatus>> = LazyLock::new(|| {
    [
        (ShortLiteral::from_static("OK"), ReplyStatus::Ok),
        (ShortLiteral::from_static("PONG"), ReplyStatus::Pong),
        (ShortLiteral::from_static("QUEUED"), ReplyStatus::Queued),
    ]
    .into_iter()
    .collect()
});

static ERROR_PREFIXES: LazyLock<LiteralMatcher<ServerErrorKind>> = LazyLock::new(|| {
    [
        (ShortLiteral::from_static("ERR"), ServerErrorKind::Generic),
        (ShortLiteral::from_static("WRONGTYPE"), ServerErrorKind::WrongType),
        (ShortLiteral::from_static("MOVED"), ServerErrorKind::Moved),
        (ShortLiteral::from_static("ASK"), ServerErrorKind::Ask),
        (ShortLiteral::from_static("LOADING"), ServerErrorKind::Loading),
        (ShortLiteral::from_static("NOAUTH"), ServerErrorKind::NoAuth),
        (ShortLiteral::from_static("BUSY"), ServerErrorKind::Busy),
        (ShortLiteral::from_static("READONLY"), ServerErrorKind::ReadOnly),
        (ShortLiteral::from_static("NOSCRIPT"), ServerErrorKind::NoScript),
        (ShortLiteral::from_static("EXECABORT"), ServerErrorKind::ExecAbort),
    ]
    .into_iter()
    .collect()
});

/// Classifies a simple-string reply body.
pub fn reply_status(text: &[u8]) -> Option<ReplyStatus> {
    STATUSES.get(text).copied()
}

/// Classifies an error reply body by its first space-delimited word.
pub fn server_error_kind(message: &[u8]) -> ServerErrorKind {
    let prefix = match message.iter().position(|&b| b == b' ') {
        Some(end) => &message[..end],
        None => message,
    };
    ERROR_PREFIXES
        .get(prefix)
        .copied()
        .unwrap_or(ServerErrorKind::Other)
}
