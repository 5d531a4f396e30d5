//! Messages exchanged between the VPN manager and its tunnel daemon.
//!
//! Each direction has one top-level message type carrying an optional
//! [`Rpc`] envelope and exactly one payload variant. Payloads are encoded
//! as externally tagged JSON objects, e.g.
//! `{"rpc":{"msg_id":3,"response_to":0},"msg":{"start":{...}}}`.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::envelope::{Rpc, RpcMessage};
use crate::speaker::Speaker;

/// Speaker held by the manager: sends [`ManagerMessage`], receives [`TunnelMessage`].
pub type ManagerSpeaker = Speaker<ManagerMessage, TunnelMessage>;

/// Speaker held by the tunnel daemon: sends [`TunnelMessage`], receives [`ManagerMessage`].
pub type TunnelSpeaker = Speaker<TunnelMessage, ManagerMessage>;

/// Message sent by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<Rpc>,
    pub msg: ManagerPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerPayload {
    Start(StartRequest),
    Stop(StopRequest),
    GetPeerUpdate(GetPeerUpdate),
    NetworkSettings(NetworkSettingsResponse),
}

/// Message sent by the tunnel daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<Rpc>,
    pub msg: TunnelPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelPayload {
    Log(Log),
    PeerUpdate(PeerUpdate),
    NetworkSettings(NetworkSettingsRequest),
    Start(StartResponse),
    Stop(StopResponse),
}

impl ManagerMessage {
    pub fn new(msg: impl Into<ManagerPayload>) -> Self {
        Self {
            rpc: None,
            msg: msg.into(),
        }
    }
}

impl TunnelMessage {
    pub fn new(msg: impl Into<TunnelPayload>) -> Self {
        Self {
            rpc: None,
            msg: msg.into(),
        }
    }
}

impl RpcMessage for ManagerMessage {
    fn rpc(&self) -> Option<Rpc> {
        self.rpc
    }

    fn set_rpc(&mut self, rpc: Option<Rpc>) {
        self.rpc = rpc;
    }
}

impl RpcMessage for TunnelMessage {
    fn rpc(&self) -> Option<Rpc> {
        self.rpc
    }

    fn set_rpc(&mut self, rpc: Option<Rpc>) {
        self.rpc = rpc;
    }
}

macro_rules! payload_from {
    ($payload:ident { $($variant:ident($ty:ty)),* $(,)? }) => {
        $(
            impl From<$ty> for $payload {
                fn from(value: $ty) -> Self {
                    $payload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(ManagerPayload {
    Start(StartRequest),
    Stop(StopRequest),
    GetPeerUpdate(GetPeerUpdate),
    NetworkSettings(NetworkSettingsResponse),
});

payload_from!(TunnelPayload {
    Log(Log),
    PeerUpdate(PeerUpdate),
    NetworkSettings(NetworkSettingsRequest),
    Start(StartResponse),
    Stop(StopResponse),
});

/// Ask the tunnel to bring the VPN up.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    /// Descriptor of the OS tunnel device, already open in the daemon.
    pub tunnel_file_descriptor: i32,
    pub coder_url: String,
    pub api_token: String,
    /// Extra headers for requests to the coordinator.
    pub headers: Vec<Header>,
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("tunnel_file_descriptor", &self.tunnel_file_descriptor)
            .field("coder_url", &self.coder_url)
            .field(
                "api_token",
                &format_args!("<redacted:{} bytes>", self.api_token.len()),
            )
            .field("headers", &self.headers)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPeerUpdate {}

macro_rules! outcome {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            pub success: bool,
            #[serde(skip_serializing_if = "String::is_empty")]
            pub error_message: String,
        }

        impl $name {
            pub fn ok() -> Self {
                Self {
                    success: true,
                    error_message: String::new(),
                }
            }

            pub fn failed(message: impl Into<String>) -> Self {
                Self {
                    success: false,
                    error_message: message.into(),
                }
            }
        }
    };
}

outcome!(
    /// Manager's answer to a [`NetworkSettingsRequest`].
    NetworkSettingsResponse
);
outcome!(
    /// Tunnel's answer to a [`StartRequest`].
    StartResponse
);
outcome!(
    /// Tunnel's answer to a [`StopRequest`].
    StopResponse
);

/// A log record forwarded from the tunnel to the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    pub level: LogLevel,
    pub message: String,
    pub logger_names: Vec<String>,
    pub fields: Vec<LogField>,
}

impl Log {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(LogField {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogField {
    pub name: String,
    pub value: String,
}

/// Changes to the set of reachable workspaces and agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerUpdate {
    pub upserted_workspaces: Vec<Workspace>,
    pub upserted_agents: Vec<Agent>,
    pub deleted_workspaces: Vec<Workspace>,
    pub deleted_agents: Vec<Agent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub status: WorkspaceStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Unknown,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Canceling,
    Canceled,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    pub fqdn: Vec<String>,
    pub ip_addrs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_handshake: Option<SystemTime>,
}

/// Tunnel's request that the manager apply OS network settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettingsRequest {
    pub tunnel_overhead_bytes: u32,
    pub mtu: u32,
    pub tunnel_remote_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_settings: Option<DnsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_settings: Option<Ipv4Settings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_settings: Option<Ipv6Settings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub servers: Vec<String>,
    pub search_domains: Vec<String>,
    pub domain_name: String,
    pub match_domains: Vec<String>,
    pub match_domains_no_search: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Settings {
    pub addrs: Vec<String>,
    pub subnet_masks: Vec<String>,
    pub router: String,
    pub included_routes: Vec<Ipv4Route>,
    pub excluded_routes: Vec<Ipv4Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Route {
    pub destination: String,
    pub mask: String,
    pub router: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Settings {
    pub addrs: Vec<String>,
    pub prefix_lengths: Vec<u32>,
    pub included_routes: Vec<Ipv6Route>,
    pub excluded_routes: Vec<Ipv6Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Route {
    pub destination: String,
    pub prefix_length: u32,
    pub router: String,
}
