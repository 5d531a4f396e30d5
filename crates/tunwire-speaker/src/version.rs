use std::fmt;
use std::str::FromStr;

/// Protocol versions this build speaks, least preferred first.
///
/// The handshake treats the *last* entry as most preferred.
pub const SUPPORTED_VERSIONS: &[ProtoVersion] = &[ProtoVersion::new(1, 0)];

/// A `<major>.<minor>` protocol version.
///
/// Peers can only talk if they share a major version; the minor number
/// gates optional features within that major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtoVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtoVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error returned when a version token is not `<major>.<minor>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{0}': expected '<major>.<minor>'")]
pub struct ParseVersionError(pub String);

impl FromStr for ProtoVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        if !is_numeric(major) || !is_numeric(minor) {
            return Err(invalid());
        }
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

// `u32::from_str` accepts a leading '+'; the wire format does not.
fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// The identity a peer presents in its handshake header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The privileged process that controls the tunnel.
    Manager,
    /// The tunnel daemon spawned by the manager.
    Tunnel,
}

impl Role {
    /// Header token for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Tunnel => "tunnel",
        }
    }

    /// The role expected on the other end of the connection.
    pub fn peer(self) -> Role {
        match self {
            Role::Manager => Role::Tunnel,
            Role::Tunnel => Role::Manager,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manager" => Ok(Role::Manager),
            "tunnel" => Ok(Role::Tunnel),
            other => Err(other.to_string()),
        }
    }
}
