//! # Segmented Frame Reader
//!
//! Purpose: Walk an immutable sequence of received byte segments and carve
//! out RESP2 tokens without copying them.
//!
//! ## Design Principles
//! 1. **Zero-Copy Slicing**: Sub-ranges are returned as `Bytes` slices that
//!    share the received segments; bytes are copied only when a caller asks
//!    for a contiguous view of a range that spans segments.
//! 2. **Copy Snapshots**: `FrameReader` is `Copy`. Lookahead scans work on a
//!    copy, and callers retry "need more data" from a saved copy.
//! 3. **Boundary Agnostic**: Results never depend on where segments split,
//!    including a CR ending one segment and its LF starting the next.
//! 4. **O(delta) Positioning**: The absolute position is maintained
//!    incrementally as segments are passed, never recomputed from the start.
//!
//! ## Failure Semantics
//! - Insufficient data for a lookahead returns `None` / `NeedMoreData`.
//! - A definite-length consume past the buffered data is a hard
//!   `FrameError::Truncated` fault.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

use crate::error::FrameError;

/// Outcome of `FrameReader::try_consume_crlf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlfStatus {
    /// `\r\n` was present and consumed.
    Success,
    /// Bytes are present but are not `\r\n`.
    Failure,
    /// Fewer than the bytes needed to decide are buffered.
    NeedMoreData,
}

/// Cursor over a sequence of byte segments.
///
/// Invariant: either `index == segments.len()` or `offset` points at a valid
/// byte of `segments[index]`; empty and exhausted segments are skipped
/// eagerly.
#[derive(Debug, Clone, Copy)]
pub struct FrameReader<'a> {
    segments: &'a [Bytes],
    /// Current segment index.
    index: usize,
    /// Offset within the current segment.
    offset: usize,
    /// Total length of segments before `index`.
    passed: usize,
    /// Total length of all segments.
    total: usize,
}

impl<'a> FrameReader<'a> {
    /// Creates a reader positioned at the first byte of `segments`.
    pub fn new(segments: &'a [Bytes]) -> Self {
        let total = segments.iter().map(Bytes::len).sum();
        let mut reader = FrameReader {
            segments,
            index: 0,
            offset: 0,
            passed: 0,
            total,
        };
        reader.settle();
        reader
    }

    /// Returns a copy of the cursor for lookahead or retry.
    #[inline]
    pub fn snapshot(&self) -> Self {
        *self
    }

    /// Absolute position from the start of the first segment.
    #[inline]
    pub fn position(&self) -> usize {
        self.passed + self.offset
    }

    /// Bytes left to consume.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.total - self.position()
    }

    /// Returns true when every byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the next byte without consuming it.
    #[inline]
    pub fn peek_byte(&self) -> Option<u8> {
        self.current().first().copied()
    }

    /// Consumes and returns the next byte.
    #[inline]
    pub fn consume_byte(&mut self) -> Option<u8> {
        let byte = self.peek_byte()?;
        self.offset += 1;
        self.settle();
        Some(byte)
    }

    /// Advances `n` bytes across segment boundaries.
    ///
    /// Returns false when fewer than `n` bytes remain; the cursor position is
    /// then unspecified, so callers that need to retry must snapshot first.
    pub fn try_consume(&mut self, n: usize) -> bool {
        if n > self.remaining() {
            return false;
        }
        self.advance(n);
        true
    }

    /// Consumes `n` bytes and returns them as a zero-copy slice.
    ///
    /// # Errors
    /// `FrameError::Truncated` when fewer than `n` bytes are buffered. This is
    /// a stream desynchronization, not a retryable condition.
    pub fn consume_as_buffer(&mut self, n: usize) -> Result<BufferSlice, FrameError> {
        let available = self.remaining();
        if n > available {
            return Err(FrameError::Truncated { wanted: n, available });
        }
        Ok(self.take(n))
    }

    /// Like `consume_as_buffer`, but leaves the cursor untouched and returns
    /// `None` when the bytes are not all buffered yet.
    pub fn try_consume_as_buffer(&mut self, n: usize) -> Option<BufferSlice> {
        if n > self.remaining() {
            return None;
        }
        Some(self.take(n))
    }

    /// Consumes a `\r\n` terminator if it is next in the stream.
    ///
    /// Only `Success` moves the cursor.
    pub fn try_consume_crlf(&mut self) -> CrlfStatus {
        let mut probe = *self;
        match probe.consume_byte() {
            None => CrlfStatus::NeedMoreData,
            Some(b'\r') => match probe.consume_byte() {
                None => CrlfStatus::NeedMoreData,
                Some(b'\n') => {
                    *self = probe;
                    CrlfStatus::Success
                }
                Some(_) => CrlfStatus::Failure,
            },
            Some(_) => CrlfStatus::Failure,
        }
    }

    /// Finds the offset of the next `byte`, relative to the cursor.
    ///
    /// Snapshot scan: the cursor does not move.
    pub fn find_next(&self, byte: u8) -> Option<usize> {
        let mut base = 0;
        for chunk in self.chunks() {
            if let Some(at) = chunk.iter().position(|&b| b == byte) {
                return Some(base + at);
            }
            base += chunk.len();
        }
        None
    }

    /// Finds the offset of the next `\r\n`, relative to the cursor.
    ///
    /// The reported offset is that of the `\r`. A CR that ends one segment and
    /// an LF that starts the next are recognized as a terminator. Snapshot
    /// scan: the cursor does not move.
    pub fn find_next_crlf(&self) -> Option<usize> {
        let mut base = 0;
        let mut pending_cr = false;
        for chunk in self.chunks() {
            if pending_cr {
                if chunk[0] == b'\n' {
                    return Some(base - 1);
                }
                pending_cr = false;
            }

            let mut start = 0;
            while let Some(found) = chunk[start..].iter().position(|&b| b == b'\r') {
                let at = start + found;
                match chunk.get(at + 1) {
                    Some(b'\n') => return Some(base + at),
                    Some(_) => start = at + 1,
                    None => {
                        pending_cr = true;
                        break;
                    }
                }
            }
            base += chunk.len();
        }
        None
    }

    /// Consumes and returns everything remaining.
    pub fn consume_to_end(&mut self) -> BufferSlice {
        let n = self.remaining();
        self.take(n)
    }

    /// Unread part of the current segment.
    #[inline]
    fn current(&self) -> &'a [u8] {
        match self.segments.get(self.index) {
            Some(segment) => &segment[self.offset..],
            None => &[],
        }
    }

    /// Unread, non-empty chunks from the cursor onward.
    fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let first = self.current();
        let rest = self.segments.get(self.index + 1..).unwrap_or(&[]);
        std::iter::once(first)
            .chain(rest.iter().map(|segment| &segment[..]))
            .filter(|chunk| !chunk.is_empty())
    }

    /// Moves past exhausted and empty segments.
    #[inline]
    fn settle(&mut self) {
        while let Some(segment) = self.segments.get(self.index) {
            if self.offset < segment.len() {
                break;
            }
            self.passed += segment.len();
            self.index += 1;
            self.offset = 0;
        }
    }

    /// Advances `n` bytes; caller guarantees `n <= remaining()`.
    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let available = self.current().len();
            let step = n.min(available);
            self.offset += step;
            n -= step;
            self.settle();
        }
    }

    /// Slices `n` bytes out of the segments; caller guarantees
    /// `n <= remaining()`.
    fn take(&mut self, n: usize) -> BufferSlice {
        if n == 0 {
            return BufferSlice::empty();
        }

        let segment = &self.segments[self.index];
        if self.offset + n <= segment.len() {
            let slice = segment.slice(self.offset..self.offset + n);
            self.advance(n);
            return BufferSlice::single(slice);
        }

        let mut parts = VecDeque::with_capacity(2);
        let mut left = n;
        while left > 0 {
            let segment = &self.segments[self.index];
            let step = left.min(segment.len() - self.offset);
            parts.push_back(segment.slice(self.offset..self.offset + step));
            self.offset += step;
            left -= step;
            self.settle();
        }
        BufferSlice::split(parts, n)
    }
}

/// Zero-copy view over a byte range that may span several segments.
#[derive(Debug, Clone)]
pub struct BufferSlice {
    repr: Repr,
}

#[derive(Debug, Clone)]
enum Repr {
    Single(Bytes),
    // Parts are never empty.
    Split { parts: VecDeque<Bytes>, len: usize },
}

impl BufferSlice {
    fn empty() -> Self {
        BufferSlice {
            repr: Repr::Single(Bytes::new()),
        }
    }

    fn single(bytes: Bytes) -> Self {
        BufferSlice {
            repr: Repr::Single(bytes),
        }
    }

    fn split(parts: VecDeque<Bytes>, len: usize) -> Self {
        BufferSlice {
            repr: Repr::Split { parts, len },
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Single(bytes) => bytes.len(),
            Repr::Split { len, .. } => *len,
        }
    }

    /// Returns true if the slice is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when the bytes live in a single segment.
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        matches!(self.repr, Repr::Single(_))
    }

    /// Converts into contiguous `Bytes`.
    ///
    /// Zero-copy for contiguous slices; split slices are copied once.
    pub fn into_bytes(self) -> Bytes {
        match self.repr {
            Repr::Single(bytes) => bytes,
            Repr::Split { parts, len } => {
                let mut split = BufferSlice::split(parts, len);
                split.copy_to_bytes(len)
            }
        }
    }

    /// Copies the bytes into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for part in self.parts() {
            out.extend_from_slice(part);
        }
        out
    }

    /// Iterates over the underlying chunks.
    pub fn parts(&self) -> impl Iterator<Item = &[u8]> {
        let (single, split) = match &self.repr {
            Repr::Single(bytes) => (Some(&bytes[..]), None),
            Repr::Split { parts, .. } => (None, Some(parts.iter().map(|part| &part[..]))),
        };
        single.into_iter().chain(split.into_iter().flatten())
    }
}

impl PartialEq<[u8]> for BufferSlice {
    fn eq(&self, other: &[u8]) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut rest = other;
        for part in self.parts() {
            let (head, tail) = rest.split_at(part.len());
            if head != part {
                return false;
            }
            rest = tail;
        }
        true
    }
}

impl Buf for BufferSlice {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        match &self.repr {
            Repr::Single(bytes) => bytes,
            Repr::Split { parts, .. } => parts.front().map(|part| &part[..]).unwrap_or(&[]),
        }
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.len(), "advance past end of BufferSlice");
        match &mut self.repr {
            Repr::Single(bytes) => bytes.advance(cnt),
            Repr::Split { parts, len } => {
                *len -= cnt;
                while cnt > 0 {
                    let Some(front) = parts.front_mut() else {
                        break;
                    };
                    if cnt < front.len() {
                        front.advance(cnt);
                        break;
                    }
                    cnt -= front.len();
                    parts.pop_front();
                }
            }
        }
    }
}

/// Owner of the received-but-unparsed segments for one connection.
///
/// The reader task pushes each read as a new segment, parses through a
/// `FrameReader`, then drops the consumed prefix with `advance`.
#[derive(Debug, Default)]
pub struct SegmentQueue {
    segments: Vec<Bytes>,
    len: usize,
}

impl SegmentQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a received segment. Empty segments are ignored.
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push(segment);
    }

    /// Returns the buffered segments.
    #[inline]
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Returns a reader positioned at the first unconsumed byte.
    #[inline]
    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader::new(&self.segments)
    }

    /// Total buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buffered segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Drops the first `n` buffered bytes.
    ///
    /// # Panics
    /// If `n` exceeds the buffered length.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance past end of SegmentQueue");
        self.len -= n;

        let mut left = n;
        let mut drained = 0;
        for segment in &mut self.segments {
            if left == 0 {
                break;
            }
            if left < segment.len() {
                segment.advance(left);
                left = 0;
            } else {
                left -= segment.len();
                drained += 1;
            }
        }
        self.segments.drain(..drained);
    }
}
