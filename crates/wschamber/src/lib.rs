//! Top-level facade crate for wschamber.
//!
//! Re-exports core types and the relay library so users can depend on a single crate.

pub mod core {
    pub use wschamber_core::*;
}

pub mod relay {
    pub use wschamber_relay::*;
}
