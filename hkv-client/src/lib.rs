//! # HybridKV Multiplexed Client
//!
//! Purpose: Drive many concurrent logical callers over a single RESP2
//! connection to the HybridKV server.
//!
//! ## Design Principles
//! 1. **One Socket, Many Callers**: `Multiplexer` pipelines requests through an
//!    `ExclusiveWriteGate` and matches replies in arrival order.
//! 2. **Zero-Copy Reads**: `FrameReader` walks segmented receive buffers and
//!    hands out `Bytes` slices instead of copies.
//! 3. **Contained Completions**: `CompletionDispatcher` keeps caller code from
//!    stalling or crashing the reader task.
//! 4. **Blocking or Async**: Threads block, tasks suspend; both share the
//!    same connection.
//!
//! ## Layout
//! - `frame_reader`: segmented cursor, `BufferSlice`, `SegmentQueue`
//! - `resp`: RESP2 command encoding and incremental reply parsing
//! - `write_gate`: FIFO single-holder gate with blocking and async waits
//! - `dispatcher`: inline-then-scheduled completion delivery
//! - `multiplexer`: connection tasks and request pipeline
//! - `client`: configuration and the blocking `KVClient` facade

mod client;
pub mod dispatcher;
mod error;
pub mod frame_reader;
mod multiplexer;
pub mod resp;
pub mod write_gate;

pub use client::{ClientConfig, ClientTtl, KVClient, SchedulerKind};
pub use dispatcher::{CompletionDispatcher, CompletionStats};
pub use error::{ClientError, ClientResult, FrameError, GateError};
pub use frame_reader::{BufferSlice, CrlfStatus, FrameReader, SegmentQueue};
pub use multiplexer::{Multiplexer, MultiplexerStats};
pub use resp::RespValue;
pub use write_gate::{ExclusiveWriteGate, TicketState, WriteTicket};
