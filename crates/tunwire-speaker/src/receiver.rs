use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use tunwire_frame::{FrameConfig, FrameError, FrameReader};
use tunwire_transport::BoxedReader;

use crate::error::{Result, SpeakerError};

/// Decodes frames from the inbound half of a connection.
///
/// The read half is handed to a background task by [`messages`](Self::messages),
/// which may be called once. Dropping the returned [`Messages`] stops that
/// task and closes the read handle.
pub struct Receiver<R> {
    reader: Option<FrameReader<BoxedReader>>,
    _message: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned + Send + 'static> Receiver<R> {
    pub fn new(reader: BoxedReader, config: FrameConfig) -> Self {
        Self {
            reader: Some(FrameReader::with_config(reader, config)),
            _message: PhantomData,
        }
    }

    /// Start consuming inbound frames as decoded messages.
    ///
    /// `buffer` bounds how many decoded messages may wait for the consumer.
    /// Fails with [`SpeakerError::AlreadyConsuming`] on a second call, or
    /// after [`close`](Self::close). Must be called within a tokio runtime.
    pub fn messages(&mut self, buffer: usize) -> Result<Messages<R>> {
        let reader = self.reader.take().ok_or(SpeakerError::AlreadyConsuming)?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let token = CancellationToken::new();
        tokio::spawn(read_loop(reader, tx, token.clone()));
        Ok(Messages {
            rx,
            _guard: token.drop_guard(),
        })
    }

    /// Close the read handle without consuming. Returns whether it was still open.
    pub fn close(&mut self) -> bool {
        self.reader.take().is_some()
    }

    /// Whether the read half is still here, neither consumed nor closed.
    pub fn is_idle(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn raw_reader(&mut self) -> Option<&mut BoxedReader> {
        self.reader.as_mut().map(FrameReader::get_mut)
    }
}

impl<R> std::fmt::Debug for Receiver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("idle", &self.reader.is_some())
            .finish()
    }
}

/// Ordered sequence of decoded inbound messages.
///
/// Ends (yields `None`) when the peer closes its write half, or on the first
/// read or decode error. Errors are logged, never surfaced.
pub struct Messages<R> {
    rx: mpsc::Receiver<R>,
    _guard: DropGuard,
}

impl<R> Messages<R> {
    /// Next message, or `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<R> {
        self.rx.recv().await
    }
}

impl<R> futures_core::Stream for Messages<R> {
    type Item = R;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> {
        self.rx.poll_recv(cx)
    }
}

impl<R> std::fmt::Debug for Messages<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messages").finish_non_exhaustive()
    }
}

async fn read_loop<R>(
    mut reader: FrameReader<BoxedReader>,
    tx: mpsc::Sender<R>,
    token: CancellationToken,
) where
    R: DeserializeOwned + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => {
                debug!("inbound consumption cancelled");
                break;
            }
            frame = reader.read_frame() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => {
                debug!("peer closed its write half");
                break;
            }
            Err(err) => {
                warn!(error = %err, "inbound read failed, ending message sequence");
                break;
            }
        };

        let message = match serde_json::from_slice::<R>(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    error = %err,
                    len = frame.len(),
                    "undecodable inbound message, ending message sequence"
                );
                break;
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            sent = tx.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    // `reader` drops here, closing the read handle.
}
