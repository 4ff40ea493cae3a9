// hkv-common - Shared types and protocol keywords for HybridKV
//
// This crate defines the short literal tokens used to recognize RESP
// keywords, status words, and command names without allocating.

pub mod error;
pub mod keywords;
pub mod literal;

// Re-export for convenience
pub use error::*;
pub use keywords::*;
pub use literal::*;
