//! Pre-opened duplex byte streams for the tunnel protocol.
//!
//! A manager process and its tunnel daemon talk over one read handle and one
//! write handle each. This crate owns nothing protocol-specific: it only
//! turns descriptors (anonymous pipes on Unix, in-memory streams in tests)
//! into a [`Connection`] the framing layer can drive.

pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod pipe;

pub use error::{Result, TransportError};
pub use traits::{BoxedReader, BoxedWriter, Connection};

#[cfg(unix)]
pub use pipe::{DuplexPipe, HostPipes, RemoteEnds};
