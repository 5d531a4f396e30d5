use std::marker::PhantomData;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tunwire_frame::{FrameConfig, FrameWriter};
use tunwire_transport::BoxedWriter;

use crate::error::{HandshakeError, Result, SpeakerError};
use crate::handshake::Handshaker;
use crate::version::ProtoVersion;

/// Serializes messages onto the outbound half of a connection.
///
/// Each `send` holds the writer lock for the whole frame, so concurrent
/// callers never interleave bytes. After [`close`](Self::close) every send
/// fails with [`SpeakerError::Closed`].
pub struct Sender<S> {
    writer: Mutex<Option<FrameWriter<BoxedWriter>>>,
    _message: PhantomData<fn(&S)>,
}

impl<S: Serialize> Sender<S> {
    pub fn new(writer: BoxedWriter, config: FrameConfig) -> Self {
        Self {
            writer: Mutex::new(Some(FrameWriter::with_config(writer, config))),
            _message: PhantomData,
        }
    }

    /// Encode one message and write it as a single frame.
    pub async fn send(&self, message: &S) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SpeakerError::Closed)?;
        writer.send(&payload).await?;
        Ok(())
    }

    /// Shut down the write half. The peer sees end-of-stream.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let taken = self.writer.lock().await.take();
        match taken {
            Some(mut writer) => {
                debug!("closing write half");
                writer.shutdown().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }

    /// Run the header exchange on the raw write half before any frame is sent.
    pub(crate) async fn handshake(
        &self,
        handshaker: &Handshaker,
        reader: &mut tunwire_transport::BoxedReader,
    ) -> std::result::Result<ProtoVersion, HandshakeError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(HandshakeError::Closed)?;
        handshaker.run(reader, writer.get_mut()).await
    }
}

impl<S> std::fmt::Debug for Sender<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}
