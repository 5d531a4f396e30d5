use std::io::ErrorKind;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::codec::{encode_frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `AsyncWrite` stream.
///
/// A frame is encoded into one buffer and written with `write_all`, so a
/// single `send` either delivers the whole frame or fails. Callers sharing a
/// writer must serialize access themselves.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    closed: bool,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            closed: false,
        }
    }

    /// Encode and send one payload, then flush.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(FrameError::Closed);
        }
        let max = self.config.effective_max();
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        self.buf.clear();
        encode_frame(payload, &mut self.buf)?;
        self.inner
            .write_all(&self.buf)
            .await
            .map_err(write_error)?;
        self.inner.flush().await.map_err(write_error)?;

        trace!(len = payload.len(), "wrote frame");
        Ok(())
    }

    /// Flush and close the write direction of the underlying stream.
    ///
    /// Later sends fail with [`FrameError::Closed`].
    pub async fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        self.inner.shutdown().await.map_err(write_error)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn write_error(err: std::io::Error) -> FrameError {
    if err.kind() == ErrorKind::WriteZero {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(err)
    }
}
