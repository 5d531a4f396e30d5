//! Inter-process protocol between a VPN manager and its tunnel daemon.
//!
//! The two processes talk over a pair of anonymous pipes. Each connection
//! opens with a versioned text handshake, then carries length-prefixed JSON
//! messages with optional request/reply correlation.
//!
//! # Crate Structure
//!
//! - [`transport`]: pre-opened pipe handles and in-memory pairs
//! - [`frame`]: 4-byte big-endian length-prefixed framing
//! - [`speaker`]: handshake, message schema and unary RPC (behind `speaker` feature)

/// Re-export transport types.
pub mod transport {
    pub use tunwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tunwire_frame::*;
}

/// Re-export speaker types (requires `speaker` feature).
#[cfg(feature = "speaker")]
pub mod speaker {
    pub use tunwire_speaker::*;
}
