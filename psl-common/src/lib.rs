// psl-common - Shared types and wire constants for the pooled session layer
//
// This crate defines the error type, endpoint keys and protocol constants
// used by both the connection pool and the framed RPC channel.

pub mod error;
pub mod types;
pub mod protocol;

// Re-export for convenience
pub use error::*;
pub use types::*;
pub use protocol::*;
