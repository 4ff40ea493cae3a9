//! # Connection Multiplexer
//!
//! Purpose: Share one TCP connection between any number of concurrent
//! callers. Requests are pipelined in write order and replies are matched back
//! to callers in arrival order.
//!
//! ## Design Principles
//! 1. **Single Writer**: Callers append encoded commands to one outbound
//!    buffer under the `ExclusiveWriteGate`; a writer task flushes it.
//! 2. **Single Reader**: A reader task parses replies out of a
//!    `SegmentQueue` and hands them to the `CompletionDispatcher`.
//! 3. **Wire Order = Queue Order**: The pending operation is queued under the
//!    same ticket that appends its bytes.
//! 4. **Fail Everything Together**: Any stream fault fails every pending
//!    operation and closes the connection for good.
//!
//! ## Data Flow
//! ```text
//! caller ──gate──▶ outbound BytesMut ──notify──▶ writer task ──▶ socket
//!    │                                                            │
//!    └──▶ pending queue ◀──pop── reader task ◀── SegmentQueue ◀───┘
//!                                     │
//!                                     └──▶ dispatcher ──▶ caller
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientConfig, SchedulerKind};
use crate::dispatcher::{
    Completable, CompletionDispatcher, CompletionStats, Scheduler, SharedScheduler,
    TokioScheduler,
};
use crate::error::{ClientError, ClientResult, FrameError};
use crate::frame_reader::SegmentQueue;
use crate::resp::{encode_command, parse_reply, ParseLimits, RespValue};
use crate::write_gate::{ExclusiveWriteGate, TicketState, WriteTicket};

type Callback = Box<dyn FnOnce(ClientResult<RespValue>) + Send + 'static>;

/// Where a reply goes once it arrives.
enum Sink {
    Reply(oneshot::Sender<ClientResult<RespValue>>),
    Callback(Callback),
}

/// A reply (or failure) paired with its destination.
struct Completion {
    sink: Option<Sink>,
    result: Option<ClientResult<RespValue>>,
}

impl Completion {
    fn new(sink: Sink, result: ClientResult<RespValue>) -> Self {
        Completion {
            sink: Some(sink),
            result: Some(result),
        }
    }
}

impl Completable for Completion {
    fn try_complete(&mut self, is_async: bool) -> bool {
        match self.sink.take() {
            Some(Sink::Reply(tx)) => {
                if let Some(result) = self.result.take() {
                    if tx.send(result).is_err() {
                        tracing::debug!("caller went away before its reply arrived");
                    }
                }
                true
            }
            // User callbacks never run on the reader task.
            Some(Sink::Callback(callback)) if !is_async => {
                self.sink = Some(Sink::Callback(callback));
                false
            }
            Some(Sink::Callback(callback)) => {
                if let Some(result) = self.result.take() {
                    callback(result);
                }
                true
            }
            None => true,
        }
    }
}

struct PendingTable {
    ops: VecDeque<Sink>,
    closed: bool,
}

struct Shared {
    outbound: ExclusiveWriteGate<BytesMut>,
    pending: Mutex<PendingTable>,
    writer_wake: Notify,
    dispatcher: CompletionDispatcher,
    shutdown: CancellationToken,
    write_timeout: Option<Duration>,
}

impl Shared {
    /// Queues `args` for writing under `ticket`, or fails `sink` right away.
    fn submit(&self, mut ticket: WriteTicket<'_, BytesMut>, args: &[&[u8]], sink: Sink) {
        let refused = match ticket.state() {
            TicketState::Success => None,
            TicketState::Timeout => Some(ClientError::WriteTimeout),
            _ if self.shutdown.is_cancelled() => Some(ClientError::ConnectionClosed),
            _ => Some(ClientError::Canceled),
        };
        if let Some(err) = refused {
            self.dispatcher.complete(Completion::new(sink, Err(err)));
            return;
        }

        {
            let mut pending = self.pending.lock();
            if pending.closed {
                drop(pending);
                drop(ticket);
                self.dispatcher
                    .complete(Completion::new(sink, Err(ClientError::ConnectionClosed)));
                return;
            }
            pending.ops.push_back(sink);
        }
        encode_command(args, &mut ticket.value_mut());
        drop(ticket);
        self.writer_wake.notify_one();
    }

    /// Parses every complete reply buffered in `segments`.
    fn drain_replies(
        &self,
        segments: &mut SegmentQueue,
        limits: &ParseLimits,
    ) -> Result<usize, ClientError> {
        let mut reader = segments.reader();
        let mut replies = 0;
        while let Some(reply) = parse_reply(&mut reader, limits)? {
            let sink = self.pending.lock().ops.pop_front();
            match sink {
                Some(sink) => self.dispatcher.complete(Completion::new(sink, Ok(reply))),
                None => {
                    return Err(ClientError::Protocol(FrameError::Malformed(
                        "reply without a pending request",
                    )))
                }
            }
            replies += 1;
        }
        let consumed = reader.position();
        segments.advance(consumed);
        Ok(replies)
    }

    /// Closes the connection and fails every pending operation.
    fn teardown(&self, reason: ClientError) {
        let drained: Vec<Sink> = {
            let mut pending = self.pending.lock();
            if pending.closed {
                return;
            }
            pending.closed = true;
            pending.ops.drain(..).collect()
        };
        self.shutdown.cancel();

        match &reason {
            ClientError::ConnectionClosed => {
                tracing::debug!(pending = drained.len(), "connection closed")
            }
            _ => tracing::error!(error = %reason, pending = drained.len(), "connection torn down"),
        }
        for sink in drained {
            self.dispatcher
                .complete(Completion::new(sink, Err(fan_out(&reason))));
        }
    }
}

/// Copies a teardown reason for each pending operation.
fn fan_out(reason: &ClientError) -> ClientError {
    match reason {
        ClientError::Protocol(err) => ClientError::Protocol(err.clone()),
        ClientError::Io(err) => ClientError::Io(io::Error::new(err.kind(), err.to_string())),
        _ => ClientError::ConnectionClosed,
    }
}

/// Counters describing a live multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    pub completions: CompletionStats,
    /// Requests written or buffered but not yet answered.
    pub pending: usize,
    /// Number of times the write path has been granted.
    pub write_generation: u64,
    pub closed: bool,
}

/// One multiplexed connection.
///
/// Dropping it cancels the reader and writer tasks; operations still pending
/// fail with `ClientError::ConnectionClosed`.
pub struct Multiplexer {
    shared: Arc<Shared>,
    peer: SocketAddr,
}

impl Multiplexer {
    /// Connects and starts the reader and writer tasks on the current runtime.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let peer: SocketAddr = config.addr.parse().map_err(|_| ClientError::InvalidAddress)?;
        let stream = match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(peer))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??,
            None => TcpStream::connect(peer).await?,
        };
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let scheduler: Arc<dyn Scheduler> = match config.completion_scheduler {
            SchedulerKind::Connection => Arc::new(TokioScheduler::current()),
            SchedulerKind::Shared => Arc::new(SharedScheduler::global()),
        };
        let shared = Arc::new(Shared {
            outbound: ExclusiveWriteGate::new(BytesMut::with_capacity(config.read_buffer_size)),
            pending: Mutex::new(PendingTable {
                ops: VecDeque::new(),
                closed: false,
            }),
            writer_wake: Notify::new(),
            dispatcher: CompletionDispatcher::new(scheduler),
            shutdown: CancellationToken::new(),
            write_timeout: config.write_timeout,
        });
        let limits = ParseLimits {
            max_bulk_len: config.max_bulk_len,
            ..ParseLimits::default()
        };

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(read_loop(
            Arc::clone(&shared),
            read_half,
            limits,
            config.read_buffer_size.max(64),
        ));
        tokio::spawn(write_loop(Arc::clone(&shared), write_half));
        tracing::debug!(peer = %peer, "multiplexer connected");

        Ok(Multiplexer { shared, peer })
    }

    /// Sends a command and waits for its reply without blocking the thread.
    ///
    /// Server error replies are returned as `RespValue::Error`.
    pub async fn execute(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        let ticket = self
            .shared
            .outbound
            .acquire_suspending(self.shared.write_timeout, Some(self.shared.shutdown.clone()))
            .await;
        self.shared.submit(ticket, args, Sink::Reply(tx));
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Sends a command and blocks the calling thread until its reply arrives.
    ///
    /// # Panics
    /// Panics when called from inside an async execution context.
    pub fn execute_blocking(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.shared.outbound.acquire_blocking(self.shared.write_timeout);
        self.shared.submit(ticket, args, Sink::Reply(tx));
        rx.blocking_recv().map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Sends a command and invokes `callback` with the outcome.
    ///
    /// The callback runs on the completion scheduler, never on the reader
    /// task. This call may block the thread while the write path is busy.
    pub fn send_with_callback<F>(&self, args: &[&[u8]], callback: F)
    where
        F: FnOnce(ClientResult<RespValue>) + Send + 'static,
    {
        let ticket = self.shared.outbound.acquire_blocking(self.shared.write_timeout);
        self.shared.submit(ticket, args, Sink::Callback(Box::new(callback)));
    }

    /// Closes the connection, failing every pending operation.
    pub fn close(&self) {
        self.shared.teardown(ClientError::ConnectionClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pending.lock().closed
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> MultiplexerStats {
        let (pending, closed) = {
            let table = self.shared.pending.lock();
            (table.ops.len(), table.closed)
        };
        MultiplexerStats {
            completions: self.shared.dispatcher.stats(),
            pending,
            write_generation: self.shared.outbound.generation(),
            closed,
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("peer", &self.peer)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut socket: OwnedReadHalf,
    limits: ParseLimits,
    chunk_size: usize,
) {
    let mut segments = SegmentQueue::new();
    let mut buf = BytesMut::with_capacity(chunk_size);
    let reason = loop {
        buf.reserve(chunk_size);
        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break ClientError::ConnectionClosed,
            read = socket.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                tracing::debug!("server closed the connection");
                break ClientError::ConnectionClosed;
            }
            Ok(_) => segments.push(buf.split().freeze()),
            Err(err) => break ClientError::Io(err),
        }
        if let Err(err) = shared.drain_replies(&mut segments, &limits) {
            break err;
        }
    };
    shared.teardown(reason);
}

async fn write_loop(shared: Arc<Shared>, mut socket: OwnedWriteHalf) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.writer_wake.notified() => {}
        }
        loop {
            let chunk = {
                let mut ticket = shared
                    .outbound
                    .acquire_suspending(None, Some(shared.shutdown.clone()))
                    .await;
                let Ok(mut buf) = ticket.try_value_mut() else {
                    return;
                };
                if buf.is_empty() {
                    break;
                }
                buf.split().freeze()
            };
            if let Err(err) = socket.write_all(&chunk).await {
                shared.teardown(ClientError::Io(err));
                return;
            }
        }
    }
    if let Err(err) = socket.shutdown().await {
        tracing::debug!(error = %err, "write half shutdown failed");
    }
}
