//! Versioned, framed messaging with unary RPC between a VPN manager and its
//! tunnel daemon.
//!
//! A connection starts with a one-line text handshake that checks the peer's
//! role and negotiates a protocol version. After that every message is a
//! length-prefixed JSON frame. Messages carry an optional RPC envelope that
//! marks them as a request awaiting a reply or as the reply to one.
//!
//! [`Speaker`] ties it together: [`Speaker::send`] for one-way messages,
//! [`Speaker::unary_rpc`] for calls, [`Speaker::incoming`] for everything the
//! peer initiates.

pub mod envelope;
pub mod error;
pub mod handshake;
pub mod proto;
pub mod receiver;
pub mod secretary;
pub mod sender;
pub mod speaker;
pub mod version;

pub use envelope::{classify, Rpc, RpcKind, RpcMessage};
pub use error::{HandshakeError, Result, RpcError, SpeakerError};
pub use handshake::{select_version, HandshakeConfig, Handshaker, PREAMBLE};
pub use proto::{
    ManagerMessage, ManagerPayload, ManagerSpeaker, TunnelMessage, TunnelPayload, TunnelSpeaker,
};
pub use receiver::{Messages, Receiver};
pub use secretary::{ReplySlot, Secretary};
pub use sender::Sender;
pub use speaker::{Incoming, IncomingMessage, RpcRequest, Speaker, SpeakerConfig};
pub use version::{ParseVersionError, ProtoVersion, Role, SUPPORTED_VERSIONS};
