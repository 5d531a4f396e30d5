use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};
use tunwire_frame::FrameConfig;
use tunwire_transport::Connection;

use crate::envelope::{Rpc, RpcKind, RpcMessage};
use crate::error::{Result, RpcError, SpeakerError};
use crate::handshake::{HandshakeConfig, Handshaker};
use crate::receiver::{Messages, Receiver};
use crate::secretary::Secretary;
use crate::sender::Sender;
use crate::version::{ProtoVersion, Role};

const DEFAULT_RECEIVE_BUFFER: usize = 32;

/// Speaker configuration.
#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    pub handshake: HandshakeConfig,
    pub frame: FrameConfig,
    /// Decoded messages allowed to queue between the read loop and dispatch,
    /// and again between dispatch and the [`Incoming`] consumer.
    pub receive_buffer: usize,
    /// Bound on each unary call. `None` waits until a reply or shutdown.
    pub rpc_timeout: Option<Duration>,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
            receive_buffer: DEFAULT_RECEIVE_BUFFER,
            rpc_timeout: None,
        }
    }
}

/// One side of a manager/tunnel connection.
///
/// Sends `S` and receives `R`. After [`handshake`](Self::handshake) succeeds
/// a dispatch task reads every inbound message: replies go to the pending
/// unary call that awaits them, everything else is queued for
/// [`incoming`](Self::incoming). At most `receive_buffer` events wait for a
/// consumer; after that dispatch stops reading, so a reply sent behind an
/// unconsumed event is routed only once that event is taken.
///
/// The dispatch task ends when the peer closes its write half, on the first
/// inbound error, on [`close_read`](Self::close_read), or when the
/// [`Incoming`] stream or the speaker is dropped. Any unary call still
/// waiting at that point fails with [`RpcError::Shutdown`].
pub struct Speaker<S, R> {
    handshaker: Handshaker,
    receive_buffer: usize,
    rpc_timeout: Option<Duration>,
    version: Option<ProtoVersion>,
    sender: Arc<Sender<S>>,
    receiver: Mutex<Option<Receiver<R>>>,
    secretary: Arc<Secretary<R>>,
    events: Mutex<Option<mpsc::Receiver<IncomingMessage<S, R>>>>,
    dispatch: CancellationToken,
}

impl<S: RpcMessage, R: RpcMessage> Speaker<S, R> {
    /// Wrap a connection with default configuration.
    pub fn new(role: Role, connection: Connection) -> Self {
        Self::with_config(role, connection, SpeakerConfig::default())
    }

    /// Wrap a connection with explicit configuration.
    pub fn with_config(role: Role, connection: Connection, config: SpeakerConfig) -> Self {
        let (reader, writer) = connection.into_split();
        Self {
            handshaker: Handshaker::new(role, config.handshake),
            receive_buffer: config.receive_buffer,
            rpc_timeout: config.rpc_timeout,
            version: None,
            sender: Arc::new(Sender::new(writer, config.frame.clone())),
            receiver: Mutex::new(Some(Receiver::new(reader, config.frame))),
            secretary: Arc::new(Secretary::new()),
            events: Mutex::new(None),
            dispatch: CancellationToken::new(),
        }
    }

    /// Negotiate a protocol version with the peer and start dispatching.
    ///
    /// Must succeed before any other traffic. On failure both halves of the
    /// connection are closed and the speaker is unusable.
    pub async fn handshake(&mut self) -> Result<ProtoVersion> {
        if self.version.is_some() {
            return Err(SpeakerError::AlreadyHandshaken);
        }

        let receiver = self
            .receiver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let reader = receiver
            .as_mut()
            .and_then(|receiver| receiver.raw_reader())
            .ok_or(SpeakerError::Closed)?;

        let outcome = self.sender.handshake(&self.handshaker, reader).await;
        match outcome {
            Ok(version) => {
                self.version = Some(version);
                self.start_dispatch()?;
                debug!(role = %self.role(), %version, "speaker ready");
                Ok(version)
            }
            Err(err) => {
                warn!(role = %self.role(), error = %err, "handshake failed, closing connection");
                self.abort().await;
                Err(err.into())
            }
        }
    }

    /// Send a one-way message.
    pub async fn send(&self, message: &S) -> Result<()> {
        self.ensure_ready()?;
        self.sender.send(message).await
    }

    /// Send `request` as a unary call and wait for its reply.
    ///
    /// The request's envelope is overwritten with a fresh id. If the send
    /// fails, times out, or this future is dropped, the pending slot is
    /// erased and a reply arriving later is discarded.
    pub async fn unary_rpc(&self, mut request: S) -> Result<R> {
        self.ensure_ready()?;
        let (id, slot) = self.secretary.record()?;
        let _call = PendingCall {
            secretary: &self.secretary,
            id,
        };

        request.set_rpc(Some(Rpc::request(id)));
        self.sender.send(&request).await?;
        trace!(id, "request sent, awaiting reply");

        let outcome = match self.rpc_timeout {
            Some(limit) => tokio::time::timeout(limit, slot).await.map_err(|_| {
                debug!(id, ?limit, "unary call timed out");
                SpeakerError::Timeout(limit)
            })?,
            None => slot.await,
        };
        // A dropped slot means the secretary itself is gone.
        let reply = outcome.map_err(|_| RpcError::Shutdown)??;
        Ok(reply)
    }

    /// Take the stream of peer-initiated messages and requests.
    ///
    /// Available once per speaker. Dropping the stream closes the read half,
    /// which also fails any pending unary calls.
    pub fn incoming(&self) -> Result<Incoming<S, R>> {
        self.ensure_ready()?;
        let rx = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SpeakerError::AlreadyConsuming)?;
        Ok(Incoming {
            rx,
            _guard: self.dispatch.clone().drop_guard(),
        })
    }

    /// Stop sending. The peer sees end-of-stream; inbound traffic still flows.
    pub async fn close_write(&self) -> Result<()> {
        self.sender.close().await
    }

    /// Stop receiving and release the read handle.
    ///
    /// Pending unary calls fail with [`RpcError::Shutdown`].
    pub fn close_read(&self) {
        self.dispatch.cancel();
        if let Some(mut receiver) = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            receiver.close();
        }
        self.secretary.shutdown();
    }

    /// Close both halves.
    pub async fn close(&self) -> Result<()> {
        self.close_read();
        self.close_write().await
    }

    /// Negotiated version, once the handshake has succeeded.
    pub fn version(&self) -> Option<ProtoVersion> {
        self.version
    }

    pub fn role(&self) -> Role {
        self.handshaker.role()
    }

    /// Unary calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.secretary.pending()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.version.is_none() {
            return Err(SpeakerError::NotReady);
        }
        Ok(())
    }

    fn start_dispatch(&mut self) -> Result<()> {
        let mut receiver = self
            .receiver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SpeakerError::Closed)?;
        let messages = receiver.messages(self.receive_buffer)?;

        let (tx, rx) = mpsc::channel(self.receive_buffer.max(1));
        *self.events.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(rx);

        tokio::spawn(dispatch(
            messages,
            tx,
            Arc::clone(&self.sender),
            Arc::clone(&self.secretary),
            self.dispatch.clone(),
        ));
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(mut receiver) = self
            .receiver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            receiver.close();
        }
        if let Err(err) = self.sender.close().await {
            debug!(error = %err, "write half already unusable");
        }
        self.secretary.shutdown();
    }
}

impl<S, R> Drop for Speaker<S, R> {
    fn drop(&mut self) {
        self.dispatch.cancel();
        self.secretary.shutdown();
    }
}

impl<S, R> std::fmt::Debug for Speaker<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Speaker")
            .field("role", &self.handshaker.role())
            .field("version", &self.version)
            .field("secretary", &self.secretary)
            .finish_non_exhaustive()
    }
}

/// Erases its call's slot when the call ends for any reason.
struct PendingCall<'a, R> {
    secretary: &'a Secretary<R>,
    id: u64,
}

impl<R> Drop for PendingCall<'_, R> {
    fn drop(&mut self) {
        if self.secretary.erase(self.id) {
            trace!(id = self.id, "erased abandoned call");
        }
    }
}

/// A peer-initiated inbound event.
#[derive(Debug)]
pub enum IncomingMessage<S, R> {
    /// A one-way message.
    Message(R),
    /// A request that expects a reply.
    Rpc(RpcRequest<S, R>),
}

/// An inbound request together with the means to answer it.
pub struct RpcRequest<S, R> {
    message: R,
    id: u64,
    sender: Arc<Sender<S>>,
}

impl<S: RpcMessage, R: RpcMessage> RpcRequest<S, R> {
    pub fn message(&self) -> &R {
        &self.message
    }

    /// The peer's `msg_id` for this request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send `response` back, stamped as the reply to this request.
    pub async fn reply(self, mut response: S) -> Result<()> {
        response.set_rpc(Some(Rpc::response(self.id)));
        self.sender.send(&response).await
    }
}

impl<S, R: std::fmt::Debug> std::fmt::Debug for RpcRequest<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRequest")
            .field("id", &self.id)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of [`IncomingMessage`]s, in the order the peer sent them.
///
/// Ends once the speaker stops reading. Dropping it closes the read half.
pub struct Incoming<S, R> {
    rx: mpsc::Receiver<IncomingMessage<S, R>>,
    _guard: DropGuard,
}

impl<S, R> Incoming<S, R> {
    pub async fn next(&mut self) -> Option<IncomingMessage<S, R>> {
        self.rx.recv().await
    }
}

impl<S, R> futures_core::Stream for Incoming<S, R> {
    type Item = IncomingMessage<S, R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<S, R> std::fmt::Debug for Incoming<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming").finish_non_exhaustive()
    }
}

async fn dispatch<S, R>(
    mut messages: Messages<R>,
    events: mpsc::Sender<IncomingMessage<S, R>>,
    sender: Arc<Sender<S>>,
    secretary: Arc<Secretary<R>>,
    token: CancellationToken,
) where
    S: RpcMessage,
    R: RpcMessage,
{
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = messages.next() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let event = match message.kind() {
            Ok(RpcKind::Plain) => IncomingMessage::Message(message),
            Ok(RpcKind::Request(id)) => IncomingMessage::Rpc(RpcRequest {
                message,
                id,
                sender: Arc::clone(&sender),
            }),
            Ok(RpcKind::Response(id)) => {
                if let Err(err) = secretary.route(message) {
                    warn!(id, error = %err, "dropping unroutable reply");
                }
                continue;
            }
            Err(err) => {
                warn!(error = %err, "dropping message with invalid rpc envelope");
                continue;
            }
        };

        // Waits while the consumer is `receive_buffer` events behind.
        tokio::select! {
            _ = token.cancelled() => break,
            sent = events.send(event) => {
                if sent.is_err() {
                    trace!("inbound event dropped, consumer gone");
                }
            }
        }
    }

    // Dropping `messages` stops the read loop and releases the read handle.
    drop(messages);
    let failed = secretary.shutdown();
    debug!(failed, "inbound dispatch ended");
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tunwire_frame::{FrameReader, FrameWriter};
    use tunwire_transport::{BoxedReader, BoxedWriter, DuplexPipe};

    use super::*;
    use crate::error::HandshakeError;
    use crate::proto::{
        GetPeerUpdate, Log, LogLevel, ManagerMessage, ManagerPayload, ManagerSpeaker, StartRequest,
        StartResponse, StopRequest, TunnelMessage, TunnelPayload, TunnelSpeaker,
    };

    async fn connected_with(
        manager_config: SpeakerConfig,
        tunnel_config: SpeakerConfig,
    ) -> (ManagerSpeaker, TunnelSpeaker) {
        let (left, right) = Connection::memory_pair(4096);
        let mut manager = Speaker::with_config(Role::Manager, left, manager_config);
        let mut tunnel = Speaker::with_config(Role::Tunnel, right, tunnel_config);
        let (m, t) = tokio::join!(manager.handshake(), tunnel.handshake());
        m.unwrap();
        t.unwrap();
        (manager, tunnel)
    }

    async fn connected() -> (ManagerSpeaker, TunnelSpeaker) {
        connected_with(SpeakerConfig::default(), SpeakerConfig::default()).await
    }

    /// A manager speaker whose peer is driven by hand, frame by frame.
    async fn manager_with_raw_tunnel() -> (
        ManagerSpeaker,
        FrameReader<BoxedReader>,
        FrameWriter<BoxedWriter>,
    ) {
        let (left, right) = Connection::memory_pair(4096);
        let mut manager = Speaker::new(Role::Manager, left);
        let (mut rx, mut tx) = right.into_split();
        let tunnel = Handshaker::new(Role::Tunnel, HandshakeConfig::default());
        let (m, t) = tokio::join!(manager.handshake(), tunnel.run(&mut rx, &mut tx));
        m.unwrap();
        t.unwrap();
        (manager, FrameReader::new(rx), FrameWriter::new(tx))
    }

    async fn send_raw(writer: &mut FrameWriter<BoxedWriter>, message: &TunnelMessage) {
        writer
            .send(&serde_json::to_vec(message).unwrap())
            .await
            .unwrap();
    }

    async fn read_raw(reader: &mut FrameReader<BoxedReader>) -> ManagerMessage {
        serde_json::from_slice(&reader.read_frame().await.unwrap()).unwrap()
    }

    /// Answer every request with a `StartResponse` naming the request id.
    fn echo_ids(tunnel: &TunnelSpeaker) -> tokio::task::JoinHandle<()> {
        let mut incoming = tunnel.incoming().unwrap();
        tokio::spawn(async move {
            while let Some(event) = incoming.next().await {
                if let IncomingMessage::Rpc(request) = event {
                    let id = request.id();
                    request
                        .reply(TunnelMessage::new(StartResponse::failed(id.to_string())))
                        .await
                        .unwrap();
                }
            }
        })
    }

    fn echoed_id(reply: &TunnelMessage) -> u64 {
        match &reply.msg {
            TunnelPayload::Start(resp) => resp.error_message.parse().unwrap(),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn log(text: &str) -> TunnelMessage {
        TunnelMessage::new(Log::new(LogLevel::Info, text))
    }

    async fn wait_for_pending(speaker: &ManagerSpeaker, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while speaker.pending_calls() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn handshake_negotiates_version() {
        let (manager, tunnel) = connected().await;
        assert_eq!(manager.version(), Some(ProtoVersion::new(1, 0)));
        assert_eq!(tunnel.version(), Some(ProtoVersion::new(1, 0)));
        assert_eq!(manager.role(), Role::Manager);
        assert_eq!(tunnel.role(), Role::Tunnel);
    }

    #[tokio::test]
    async fn traffic_before_handshake_is_rejected() {
        let (left, _right) = Connection::memory_pair(64);
        let manager: ManagerSpeaker = Speaker::new(Role::Manager, left);
        assert!(matches!(
            manager.send(&ManagerMessage::new(StopRequest {})).await,
            Err(SpeakerError::NotReady)
        ));
        assert!(matches!(
            manager.unary_rpc(ManagerMessage::new(StopRequest {})).await,
            Err(SpeakerError::NotReady)
        ));
        assert!(matches!(manager.incoming(), Err(SpeakerError::NotReady)));
    }

    #[tokio::test]
    async fn second_handshake_is_rejected() {
        let (mut manager, _tunnel) = connected().await;
        assert!(matches!(
            manager.handshake().await,
            Err(SpeakerError::AlreadyHandshaken)
        ));
    }

    #[tokio::test]
    async fn same_roles_fail_on_both_sides() {
        let (left, right) = Connection::memory_pair(64);
        let mut a: ManagerSpeaker = Speaker::new(Role::Manager, left);
        let mut b: ManagerSpeaker = Speaker::new(Role::Manager, right);
        let (ra, rb) = tokio::join!(a.handshake(), b.handshake());
        assert!(matches!(
            ra,
            Err(SpeakerError::Handshake(HandshakeError::WrongRole(_)))
        ));
        assert!(matches!(
            rb,
            Err(SpeakerError::Handshake(HandshakeError::WrongRole(_)))
        ));
        assert!(a.version().is_none());
    }

    #[tokio::test]
    async fn failed_handshake_closes_both_halves() {
        let (left, right) = DuplexPipe::pair().unwrap();
        let mut manager: ManagerSpeaker = Speaker::new(Role::Manager, left.into());
        let (mut rx, mut tx) = right.into_split();

        tx.write_all(b"something tunnel 1.0\n").await.unwrap();

        let err = manager.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            SpeakerError::Handshake(HandshakeError::InvalidHeader(_))
        ));

        // Our header was written, then the write half was shut.
        let mut seen = Vec::new();
        rx.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"codervpn manager 1.0\n");

        // The read half is gone too: writes into it now fail.
        let broke = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if tx.write_all(&[0u8; 1024]).await.is_err() {
                    return true;
                }
            }
        })
        .await
        .unwrap();
        assert!(broke);

        assert!(matches!(
            manager.handshake().await,
            Err(SpeakerError::Closed)
        ));
    }

    #[tokio::test]
    async fn unary_rpc_round_trip() {
        let (manager, mut reader, mut writer) = manager_with_raw_tunnel().await;

        let peer = tokio::spawn(async move {
            let request = read_raw(&mut reader).await;
            let id = request.rpc.unwrap().msg_id;
            assert!(matches!(request.msg, ManagerPayload::Start(_)));

            let mut reply = TunnelMessage::new(StartResponse::ok());
            reply.rpc = Some(Rpc::response(id));
            send_raw(&mut writer, &reply).await;
            (id, reader, writer)
        });

        let request = ManagerMessage::new(StartRequest {
            coder_url: "https://coder.example.com".into(),
            ..StartRequest::default()
        });
        let reply = manager.unary_rpc(request).await.unwrap();
        let (id, _reader, _writer) = peer.await.unwrap();

        assert_eq!(id, 1);
        assert_eq!(reply.msg, TunnelPayload::Start(StartResponse::ok()));
        assert_eq!(reply.rpc, Some(Rpc::response(1)));
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn thirty_third_call_is_answered_by_id() {
        let (manager, tunnel) = connected().await;
        let _server = echo_ids(&tunnel);

        let mut last = 0;
        for _ in 0..33 {
            let reply = manager
                .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
                .await
                .unwrap();
            last = echoed_id(&reply);
            assert_eq!(reply.rpc, Some(Rpc::response(last)));
        }
        assert_eq!(last, 33);
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_get_distinct_ids() {
        let (manager, tunnel) = connected().await;
        let _server = echo_ids(&tunnel);
        let manager = Arc::new(manager);

        let calls: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let reply = manager
                        .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
                        .await
                        .unwrap();
                    echoed_id(&reply)
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for call in calls {
            ids.insert(call.await.unwrap());
        }
        assert_eq!(ids, (1..=16).collect::<HashSet<u64>>());
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_reply_is_dropped_and_connection_survives() {
        let (manager, mut reader, mut writer) = manager_with_raw_tunnel().await;
        let mut incoming = manager.incoming().unwrap();

        let mut stray = log("stray");
        stray.rpc = Some(Rpc::response(999));
        send_raw(&mut writer, &stray).await;
        let mut both = log("both ids");
        both.rpc = Some(Rpc {
            msg_id: 5,
            response_to: 6,
        });
        send_raw(&mut writer, &both).await;
        send_raw(&mut writer, &log("after")).await;

        match incoming.next().await {
            Some(IncomingMessage::Message(msg)) => assert_eq!(msg, log("after")),
            other => panic!("unexpected event {other:?}"),
        }

        manager
            .send(&ManagerMessage::new(StopRequest {}))
            .await
            .unwrap();
        let echoed = read_raw(&mut reader).await;
        assert_eq!(echoed.msg, ManagerPayload::Stop(StopRequest {}));
    }

    #[tokio::test]
    async fn ten_one_way_sends_arrive_in_order() {
        let (manager, tunnel) = connected().await;
        let mut incoming = tunnel.incoming().unwrap();

        for _ in 0..10 {
            manager
                .send(&ManagerMessage::new(GetPeerUpdate {}))
                .await
                .unwrap();
        }
        manager.close_write().await.unwrap();

        let mut count = 0;
        while let Some(event) = incoming.next().await {
            match event {
                IncomingMessage::Message(msg) => {
                    assert_eq!(msg.msg, ManagerPayload::GetPeerUpdate(GetPeerUpdate {}));
                    assert!(msg.rpc.is_none());
                }
                other => panic!("unexpected event {other:?}"),
            }
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn inbound_requests_carry_their_id() {
        let (manager, tunnel) = connected().await;
        let mut incoming = tunnel.incoming().unwrap();

        let call = tokio::spawn({
            let manager = Arc::new(manager);
            async move {
                let reply = manager
                    .unary_rpc(ManagerMessage::new(StopRequest {}))
                    .await
                    .unwrap();
                (reply, manager)
            }
        });

        let request = match incoming.next().await {
            Some(IncomingMessage::Rpc(request)) => request,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(request.id(), 1);
        assert_eq!(request.message().msg, ManagerPayload::Stop(StopRequest {}));
        request
            .reply(TunnelMessage::new(StartResponse::ok()))
            .await
            .unwrap();

        let (reply, _manager) = call.await.unwrap();
        assert_eq!(reply.rpc, Some(Rpc::response(1)));
    }

    #[tokio::test]
    async fn peer_closing_fails_every_pending_call() {
        let (manager, tunnel) = connected().await;
        let mut incoming = tunnel.incoming().unwrap();
        let manager = Arc::new(manager);

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager
                        .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
                        .await
                })
            })
            .collect();

        // Hold every request without answering.
        let mut held = Vec::new();
        for _ in 0..5 {
            match incoming.next().await {
                Some(IncomingMessage::Rpc(request)) => held.push(request),
                other => panic!("unexpected event {other:?}"),
            }
        }
        wait_for_pending(&manager, 5).await;

        tunnel.close_write().await.unwrap();
        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(SpeakerError::Rpc(RpcError::Shutdown))
            ));
        }
        assert_eq!(manager.pending_calls(), 0);
        assert!(matches!(
            manager
                .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
                .await,
            Err(SpeakerError::Rpc(RpcError::Shutdown))
        ));
    }

    #[tokio::test]
    async fn close_read_fails_pending_calls() {
        let (manager, _tunnel) = connected().await;
        let manager = Arc::new(manager);

        let call = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
                    .await
            }
        });
        wait_for_pending(&manager, 1).await;

        manager.close_read();
        assert!(matches!(
            call.await.unwrap(),
            Err(SpeakerError::Rpc(RpcError::Shutdown))
        ));
    }

    #[tokio::test]
    async fn timed_out_call_erases_slot_and_late_reply_is_dropped() {
        let config = SpeakerConfig {
            rpc_timeout: Some(Duration::from_millis(50)),
            ..SpeakerConfig::default()
        };
        let (manager, tunnel) = connected_with(config, SpeakerConfig::default()).await;
        let mut incoming = tunnel.incoming().unwrap();

        let err = manager
            .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
            .await
            .unwrap_err();
        assert!(matches!(err, SpeakerError::Timeout(_)));
        assert_eq!(manager.pending_calls(), 0);

        // Answer the abandoned call late, then serve normally.
        let late = match incoming.next().await {
            Some(IncomingMessage::Rpc(request)) => request,
            other => panic!("unexpected event {other:?}"),
        };
        late.reply(TunnelMessage::new(StartResponse::ok()))
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            if let Some(IncomingMessage::Rpc(request)) = incoming.next().await {
                let id = request.id();
                request
                    .reply(TunnelMessage::new(StartResponse::failed(id.to_string())))
                    .await
                    .unwrap();
            }
            incoming
        });
        let reply = manager
            .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
            .await
            .unwrap();
        assert_eq!(echoed_id(&reply), 2);
        let _incoming = server.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_call_erases_its_slot() {
        let (manager, _tunnel) = connected().await;
        let call = manager.unary_rpc(ManagerMessage::new(GetPeerUpdate {}));
        let result = tokio::time::timeout(Duration::from_millis(20), call).await;
        assert!(result.is_err());
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn incoming_is_single_consumer() {
        let (manager, _tunnel) = connected().await;
        let _incoming = manager.incoming().unwrap();
        assert!(matches!(
            manager.incoming(),
            Err(SpeakerError::AlreadyConsuming)
        ));
    }

    #[tokio::test]
    async fn half_close_keeps_inbound_flowing() {
        let (manager, tunnel) = connected().await;
        let mut from_tunnel = manager.incoming().unwrap();
        let mut from_manager = tunnel.incoming().unwrap();

        manager.close_write().await.unwrap();
        assert!(from_manager.next().await.is_none());
        assert!(matches!(
            manager.send(&ManagerMessage::new(StopRequest {})).await,
            Err(SpeakerError::Closed)
        ));

        tunnel.send(&log("still here")).await.unwrap();
        match from_tunnel.next().await {
            Some(IncomingMessage::Message(msg)) => assert_eq!(msg, log("still here")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unconsumed_events_are_bounded_by_receive_buffer() {
        let config = SpeakerConfig {
            receive_buffer: 4,
            ..SpeakerConfig::default()
        };
        let (manager, tunnel) = connected_with(config, SpeakerConfig::default()).await;

        let flood = tokio::spawn(async move {
            for i in 0..500 {
                tunnel.send(&log(&format!("flood-{i}"))).await.unwrap();
            }
            tunnel
        });

        let queued = || {
            manager
                .events
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |rx| rx.len())
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while queued() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queued(), 4);
        assert!(!flood.is_finished());

        let mut incoming = manager.incoming().unwrap();
        for i in 0..500 {
            match incoming.next().await {
                Some(IncomingMessage::Message(msg)) => {
                    assert_eq!(msg, log(&format!("flood-{i}")));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        let _tunnel = flood.await.unwrap();
    }

    #[tokio::test]
    async fn incoming_polls_as_a_stream() {
        use futures_core::Stream;

        let (manager, tunnel) = connected().await;
        let mut incoming = manager.incoming().unwrap();

        tunnel.send(&log("one")).await.unwrap();
        tunnel.send(&log("two")).await.unwrap();
        tunnel.close_write().await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) =
            std::future::poll_fn(|cx| Pin::new(&mut incoming).poll_next(cx)).await
        {
            match event {
                IncomingMessage::Message(msg) => seen.push(msg),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(seen, vec![log("one"), log("two")]);
    }
}
