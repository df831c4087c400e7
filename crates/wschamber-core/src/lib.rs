//! wschamber core: frame codec, pooled buffers, and shared error types
//! (transport-agnostic).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod buffer;
pub mod error;
pub mod frame;

/// Shared result type.
pub use error::{RelayError, Result};
