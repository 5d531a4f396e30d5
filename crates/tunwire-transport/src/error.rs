use std::os::raw::c_int;

/// Errors that can occur while setting up tunnel transport handles.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A pipe-level system call failed.
    #[error("{op} failed: {source}")]
    Pipe {
        op: &'static str,
        source: std::io::Error,
    },

    /// A descriptor handed to us could not be adopted as a pipe end.
    #[error("invalid pipe descriptor {fd}: {source}")]
    InvalidDescriptor { fd: c_int, source: std::io::Error },

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
