use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// RPC envelope carried inside application messages.
///
/// A zero field means "unset". `msg_id` marks a request that wants a reply,
/// `response_to` marks the reply to an earlier request. Setting both is
/// invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rpc {
    #[serde(default)]
    pub msg_id: u64,
    #[serde(default)]
    pub response_to: u64,
}

/// What an inbound message is, as decided by its envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    /// One-way message.
    Plain,
    /// Request the peer expects us to answer with this id.
    Request(u64),
    /// Reply to a call we issued with this id.
    Response(u64),
}

impl Rpc {
    /// Envelope for an outgoing request.
    pub fn request(msg_id: u64) -> Self {
        Self {
            msg_id,
            response_to: 0,
        }
    }

    /// Envelope for a reply to `response_to`.
    pub fn response(response_to: u64) -> Self {
        Self {
            msg_id: 0,
            response_to,
        }
    }

    /// Classify this envelope.
    pub fn kind(&self) -> Result<RpcKind, RpcError> {
        match (self.msg_id, self.response_to) {
            (0, 0) => Ok(RpcKind::Plain),
            (id, 0) => Ok(RpcKind::Request(id)),
            (0, to) => Ok(RpcKind::Response(to)),
            (msg_id, response_to) => Err(RpcError::InvalidEnvelope {
                msg_id,
                response_to,
            }),
        }
    }
}

/// Classify an optional envelope; no envelope is a plain message.
pub fn classify(rpc: Option<Rpc>) -> Result<RpcKind, RpcError> {
    rpc.map_or(Ok(RpcKind::Plain), |rpc| rpc.kind())
}

/// A message type that can take part in unary RPC.
///
/// Implementors expose their envelope so the speaker can stamp outgoing
/// requests and replies and sort inbound traffic.
pub trait RpcMessage: Serialize + DeserializeOwned + Send + 'static {
    /// The envelope, if the message carries one.
    fn rpc(&self) -> Option<Rpc>;

    /// Replace the envelope.
    fn set_rpc(&mut self, rpc: Option<Rpc>);

    /// Classify this message by its envelope.
    fn kind(&self) -> Result<RpcKind, RpcError> {
        classify(self.rpc())
    }
}
