use std::time::Duration;

use crate::version::ProtoVersion;

/// Errors that abort a connection during the version handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Reading the peer's header line failed.
    #[error("failed to read handshake header: {0}")]
    Read(#[source] std::io::Error),

    /// Writing our header line failed.
    #[error("failed to write handshake header: {0}")]
    Write(#[source] std::io::Error),

    /// The peer closed its write half before sending a full header line.
    #[error("peer closed the connection during handshake")]
    Closed,

    /// The header line was not `<preamble> <role> <versions>`.
    #[error("invalid handshake header: {0}")]
    InvalidHeader(String),

    /// The peer announced our own role, or a role we don't know.
    #[error("peer announced wrong role '{0}'")]
    WrongRole(String),

    /// A version token was not `<major>.<minor>`.
    #[error("invalid protocol version '{0}'")]
    InvalidVersion(String),

    /// No announced version shares a major number with ours.
    #[error("no supported protocol version (ours: {}, theirs: {})", join(.ours), join(.theirs))]
    UnsupportedVersion {
        ours: Vec<ProtoVersion>,
        theirs: Vec<ProtoVersion>,
    },

    /// The header exchange did not finish in time.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors in correlating unary calls with their replies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// A message routed as a reply carries no RPC envelope.
    #[error("message has no rpc envelope")]
    MissingEnvelope,

    /// An envelope sets both `msg_id` and `response_to`.
    #[error("rpc envelope sets both msg_id {msg_id} and response_to {response_to}")]
    InvalidEnvelope { msg_id: u64, response_to: u64 },

    /// A reply names a call that is not outstanding.
    #[error("unknown response id {0}")]
    UnknownResponseId(u64),

    /// The connection shut down before a reply arrived.
    #[error("rpc channel shut down")]
    Shutdown,
}

/// Errors that can occur in speaker operations.
#[derive(Debug, thiserror::Error)]
pub enum SpeakerError {
    /// Handshake failed; the connection is closed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] tunwire_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// RPC correlation error.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Traffic attempted before a successful handshake.
    #[error("speaker has not completed a handshake")]
    NotReady,

    /// `handshake()` called a second time.
    #[error("handshake already completed")]
    AlreadyHandshaken,

    /// The inbound sequence was already taken by another consumer.
    #[error("inbound messages are already being consumed")]
    AlreadyConsuming,

    /// The write half was closed.
    #[error("connection closed")]
    Closed,

    /// A unary call did not receive a reply in time.
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, SpeakerError>;

fn join(versions: &[ProtoVersion]) -> String {
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
