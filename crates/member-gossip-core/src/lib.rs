//! member-gossip core library
//!
//! Building blocks shared by every node taking part in the member-gossip
//! coordination protocol.
//!
//! # Modules
//!
//! - [`clock`]: Lamport-style logical clocks (membership and request)
//! - [`types`]: Wire message types and the one-byte type tags
//! - [`codec`]: Pack/unpack boundary (postcard) and node tag encoding
//! - [`error`]: Error types

pub mod clock;
pub mod codec;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use clock::LogicalClock;
pub use error::{Error, Result};
pub use types::*;
