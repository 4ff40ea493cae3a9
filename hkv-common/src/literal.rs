//! # Short Literal Tokens
//!
//! Purpose: Recognize short fixed byte literals (status words, error prefixes,
//! command names) without allocating and without trusting a hash alone.
//!
//! ## Design Principles
//!
//! 1. **Fixed Maximum Size**: Literals are at most 31 bytes and stored inline,
//!    so tokens are `Copy` and can be built in `const` tables.
//!
//! 2. **Case Normalization**: Bytes are stored ASCII upper-cased; matching a
//!    candidate is case-insensitive.
//!
//! 3. **Fingerprint First, Bytes Always**: A 64-bit FNV-1a fingerprint picks
//!    the bucket, and every hit is confirmed by full-sequence equality. A
//!    fingerprint collision can never produce a false match.
//!
//! 4. **Len-Based Eq/Hash**: Compare and hash only initialized bytes.
//!
//! ## Memory Layout Example
//!
//! ```text
//! ShortLiteral (40 bytes total):
//! +--------+-----------+----------------+
//! | len:1B | data:31B  | fingerprint:8B |
//! +--------+-----------+----------------+
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use ahash::RandomState;
use hashbrown::HashMap;

use crate::error::{HkvError, HkvResult};

/// Maximum literal size in bytes.
pub const MAX_LITERAL_SIZE: usize = 31;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes the case-insensitive fingerprint of `bytes`.
///
/// Equal to `ShortLiteral::new(bytes)?.fingerprint()` for any input that fits
/// in a literal, so candidates can be looked up without building a token.
pub const fn fingerprint_of(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut idx = 0;
    while idx < bytes.len() {
        hash ^= bytes[idx].to_ascii_uppercase() as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        idx += 1;
    }
    hash
}

/// Immutable short byte literal with a precomputed fingerprint.
#[derive(Clone, Copy)]
pub struct ShortLiteral {
    /// Number of valid bytes in `data` (≤ MAX_LITERAL_SIZE).
    len: u8,
    /// Upper-cased literal bytes (only first `len` bytes are valid).
    data: [u8; MAX_LITERAL_SIZE],
    fingerprint: u64,
}

impl ShortLiteral {
    /// Creates a literal from a byte slice.
    ///
    /// # Errors
    /// Returns `HkvError::LiteralTooLong` if data exceeds MAX_LITERAL_SIZE
    ///
    /// # Examples
    /// ```rust
    /// use hkv_common::{HkvError, ShortLiteral, MAX_LITERAL_SIZE};
    ///
    /// let ok = ShortLiteral::new(b"ok").expect("valid literal");
    /// assert_eq!(ok.as_bytes(), b"OK");
    ///
    /// let too_long = vec![b'x'; MAX_LITERAL_SIZE + 1];
    /// assert_eq!(
    ///     ShortLiteral::new(&too_long).unwrap_err(),
    ///     HkvError::LiteralTooLong { len: MAX_LITERAL_SIZE + 1 }
    /// );
    /// ```
    pub fn new(data: &[u8]) -> HkvResult<Self> {
        if data.len() > MAX_LITERAL_SIZE {
            return Err(HkvError::LiteralTooLong { len: data.len() });
        }
        Ok(Self::build(data))
    }

    /// Creates a literal from a static string at compile time.
    ///
    /// Panics (at compile time in `const` context) when the string is longer
    /// than MAX_LITERAL_SIZE.
    pub const fn from_static(text: &'static str) -> Self {
        let bytes = text.as_bytes();
        assert!(bytes.len() <= MAX_LITERAL_SIZE, "literal exceeds inline capacity");
        Self::build(bytes)
    }

    const fn build(bytes: &[u8]) -> Self {
        let mut data = [0u8; MAX_LITERAL_SIZE];
        let mut idx = 0;
        while idx < bytes.len() {
            data[idx] = bytes[idx].to_ascii_uppercase();
            idx += 1;
        }
        ShortLiteral {
            len: bytes.len() as u8,
            data,
            fingerprint: fingerprint_of(bytes),
        }
    }

    /// Returns the normalized literal bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Returns the literal length
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the literal is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the 64-bit fingerprint.
    #[inline]
    pub const fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Returns true when `candidate` equals this literal, ignoring ASCII case.
    ///
    /// This is always a full comparison; the fingerprint is never trusted on
    /// its own.
    #[inline]
    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == self.len()
            && candidate
                .iter()
                .zip(self.as_bytes())
                .all(|(c, l)| c.to_ascii_uppercase() == *l)
    }

    #[cfg(test)]
    pub(crate) fn with_fingerprint(mut self, fingerprint: u64) -> Self {
        self.fingerprint = fingerprint;
        self
    }
}

// Compare only initialized bytes (length-prefixed buffer pattern).
impl PartialEq for ShortLiteral {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ShortLiteral {}

impl Hash for ShortLiteral {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len.hash(state);
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for ShortLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortLiteral({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for ShortLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Fingerprint-bucketed lookup table from literals to values.
///
/// Buckets are keyed by the literal fingerprint; candidates are hashed once
/// with `fingerprint_of` and then compared byte-for-byte against every entry
/// in the bucket. Candidates longer than the longest stored literal are
/// rejected before hashing.
#[derive(Clone)]
pub struct LiteralMatcher<V> {
    buckets: HashMap<u64, Vec<(ShortLiteral, V)>, RandomState>,
    len: usize,
    max_len: usize,
}

impl<V> LiteralMatcher<V> {
    /// Creates an empty matcher.
    pub fn new() -> Self {
        LiteralMatcher {
            buckets: HashMap::with_hasher(RandomState::new()),
            len: 0,
            max_len: 0,
        }
    }

    /// Inserts a literal, returning the previous value for an equal literal.
    pub fn insert(&mut self, literal: ShortLiteral, value: V) -> Option<V> {
        let bucket = self.buckets.entry(literal.fingerprint()).or_default();
        if let Some(slot) = bucket.iter_mut().find(|(existing, _)| *existing == literal) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        bucket.push((literal, value));
        self.len += 1;
        self.max_len = self.max_len.max(literal.len());
        None
    }

    /// Looks up a candidate byte sequence, ignoring ASCII case.
    pub fn get(&self, candidate: &[u8]) -> Option<&V> {
        if candidate.len() > self.max_len {
            return None;
        }
        self.buckets
            .get(&fingerprint_of(candidate))?
            .iter()
            .find(|(literal, _)| literal.matches(candidate))
            .map(|(_, value)| value)
    }

    /// Returns true when `candidate` matches a stored literal.
    #[inline]
    pub fn contains(&self, candidate: &[u8]) -> bool {
        self.get(candidate).is_some()
    }

    /// Returns the number of stored literals.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no literal is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<V> Default for LiteralMatcher<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FromIterator<(ShortLiteral, V)> for LiteralMatcher<V> {
    fn from_iter<I: IntoIterator<Item = (ShortLiteral, V)>>(iter: I) -> Self {
        let mut matcher = LiteralMatcher::new();
        for (literal, value) in iter {
            matcher.insert(literal, value);
        }
        matcher
    }
}
