use std::io::ErrorKind;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::codec::{decode_length, FrameConfig, LENGTH_PREFIX_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete frames from any `AsyncRead` stream.
///
/// Reads exactly the 4-byte prefix, then exactly the announced payload, so
/// it never consumes bytes past the end of the current frame. Callers always
/// get complete payloads.
pub struct FrameReader<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Read the next complete frame payload.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached on a
    /// frame boundary or inside a payload, and `Err(FrameError::ShortLength)`
    /// when EOF cuts a length prefix short.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0usize;
        while filled < LENGTH_PREFIX_SIZE {
            match self.inner.read(&mut prefix[filled..]).await {
                Ok(0) if filled == 0 => return Err(FrameError::ConnectionClosed),
                Ok(0) => return Err(FrameError::ShortLength { got: filled }),
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        let len = decode_length(&prefix)? as usize;
        let max = self.config.effective_max();
        if len > max {
            return Err(FrameError::PayloadTooLarge { size: len, max });
        }

        // Grow as bytes arrive rather than trusting the prefix with one allocation.
        let mut payload = Vec::with_capacity(len.min(INITIAL_BUFFER_CAPACITY));
        let read = (&mut self.inner)
            .take(len as u64)
            .read_to_end(&mut payload)
            .await?;
        if read < len {
            return Err(FrameError::ConnectionClosed);
        }

        trace!(len, "read frame");
        Ok(Bytes::from(payload))
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
