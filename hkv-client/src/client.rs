//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing Redis-compatible
//! commands to the HybridKV server over RESP2.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides multiplexing and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Shared Connection**: Every thread using one `KVClient` pipelines over
//!    the same socket.

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::runtime::{Builder, Runtime};

use hkv_common::{server_error_kind, Command, ReplyStatus};

use crate::error::{ClientError, ClientResult};
use crate::multiplexer::{Multiplexer, MultiplexerStats};
use crate::resp::{RespValue, DEFAULT_MAX_BULK_LEN};

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Where deferred completions (callbacks) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// The runtime that owns the connection.
    #[default]
    Connection,
    /// A process-wide pool shared by every connection that opts in.
    Shared,
}

/// Configuration for a multiplexed connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional limit on how long a request waits for the write path.
    pub write_timeout: Option<Duration>,
    /// Bytes requested from the socket per read.
    pub read_buffer_size: usize,
    /// Largest bulk string accepted from the server.
    pub max_bulk_len: usize,
    /// Where callback completions run.
    pub completion_scheduler: SchedulerKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            connect_timeout: None,
            write_timeout: None,
            read_buffer_size: 8 * 1024,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            completion_scheduler: SchedulerKind::Connection,
        }
    }
}

/// Synchronous client over one multiplexed connection.
///
/// The client owns a small Tokio runtime driving the connection. It is
/// `Sync`: share it between threads and their requests are pipelined.
///
/// Calls block the current thread, so do not use it from async code; use
/// [`Multiplexer`] there.
pub struct KVClient {
    // Dropped before the runtime so its tasks are canceled first.
    mux: Multiplexer,
    runtime: Runtime,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hkv-client-io")
            .enable_all()
            .build()?;
        let mux = runtime.block_on(Multiplexer::connect(config))?;
        Ok(KVClient { mux, runtime })
    }

    /// The underlying connection, for async or callback-style use.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Runs `future` on the client's runtime.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn stats(&self) -> MultiplexerStats {
        self.mux.stats()
    }

    fn exec(&self, command: Command, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut full: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        full.push(command.name());
        full.extend_from_slice(args);
        match self.mux.execute_blocking(&full)? {
            RespValue::Error(message) => Err(ClientError::Server {
                kind: server_error_kind(&message),
                message,
            }),
            reply => Ok(reply),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Bytes>> {
        match self.exec(Command::Get, &[key])? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        let reply = self.exec(Command::Set, &[key, value])?;
        expect_ok(&reply)
    }

    /// Sets a value and attaches an expiration in seconds.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        let reply = self.exec(Command::Set, &[key, value, b"EX", &seconds[..len]])?;
        expect_ok(&reply)
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        match self.exec(Command::Del, &[key])? {
            RespValue::Integer(count) => Ok(count > 0),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        match self.exec(Command::Expire, &[key, &seconds[..len]])? {
            RespValue::Integer(value) => Ok(value == 1),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns TTL status for a key.
    pub fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        match self.exec(Command::Ttl, &[key])? {
            RespValue::Integer(-2) => Ok(ClientTtl::Missing),
            RespValue::Integer(-1) => Ok(ClientTtl::NoExpiry),
            RespValue::Integer(value) if value >= 0 => {
                Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64)))
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Bytes> {
        let reply = match payload {
            Some(data) => self.exec(Command::Ping, &[data])?,
            None => self.exec(Command::Ping, &[])?,
        };
        match reply {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches server INFO output.
    pub fn info(&self) -> ClientResult<Bytes> {
        match self.exec(Command::Info, &[])? {
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

fn expect_ok(reply: &RespValue) -> ClientResult<()> {
    match reply.status() {
        Some(ReplyStatus::Ok) => Ok(()),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_u64_digits() {
        for value in [0u64, 7, 10, 86_400, u64::MAX] {
            let (buf, len) = encode_u64(value);
            assert_eq!(&buf[..len], value.to_string().as_bytes());
        }
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"addr": "10.0.0.5:7000", "completion_scheduler": "shared"}"#,
        )
        .unwrap();
        assert_eq!(config.addr, "10.0.0.5:7000");
        assert_eq!(config.completion_scheduler, SchedulerKind::Shared);
        assert_eq!(config.read_buffer_size, 8 * 1024);
        assert_eq!(config.max_bulk_len, DEFAULT_MAX_BULK_LEN);
        assert_eq!(config.write_timeout, None);
    }

    #[test]
    fn ok_status_is_case_insensitive() {
        assert!(expect_ok(&RespValue::Simple(Bytes::from_static(b"ok"))).is_ok());
        assert!(matches!(
            expect_ok(&RespValue::Integer(1)),
            Err(ClientError::UnexpectedResponse)
        ));
    }

    #[test]
    fn rejects_unparseable_address() {
        let config = ClientConfig {
            addr: "not an address".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            KVClient::with_config(config),
            Err(ClientError::InvalidAddress)
        ));
    }
}
