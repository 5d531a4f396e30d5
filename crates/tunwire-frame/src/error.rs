/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended part-way through a length prefix.
    #[error("short length prefix ({got} of 4 bytes)")]
    ShortLength { got: usize },

    /// The payload exceeds the configured (or representable) maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream at a frame boundary or mid-payload.
    #[error("connection closed")]
    ConnectionClosed,

    /// The local write half was already closed.
    #[error("write half closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
