use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

/// Type-erased read half of a connection.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Type-erased write half of a connection.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// One already-connected duplex session: a read handle and a write handle.
///
/// The two halves are independent streams. Closing the write half signals
/// end-of-data to the peer while the read half keeps draining, and dropping
/// the read half releases the inbound descriptor.
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Connection {
    /// Build a connection from any pair of async read/write handles.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }

    /// Two cross-connected in-memory connections.
    ///
    /// Bytes written on one side's write half arrive on the other side's read
    /// half. Each direction buffers up to `capacity` bytes before writers wait.
    pub fn memory_pair(capacity: usize) -> (Self, Self) {
        let (left_tx, right_rx) = tokio::io::duplex(capacity);
        let (right_tx, left_rx) = tokio::io::duplex(capacity);
        (Self::new(left_rx, left_tx), Self::new(right_rx, right_tx))
    }

    /// Split into the read half and the write half.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
