use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::HandshakeError;
use crate::version::{ProtoVersion, Role, SUPPORTED_VERSIONS};

/// Fixed first token of every handshake header.
pub const PREAMBLE: &str = "codervpn";

const DEFAULT_MAX_HEADER_LEN: usize = 256;

/// Configuration for the version handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Expected first token of both header lines.
    pub preamble: String,
    /// Locally supported versions, least preferred first.
    pub versions: Vec<ProtoVersion>,
    /// Bound on the whole header exchange. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Longest peer header accepted, excluding the newline.
    pub max_header_len: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            preamble: PREAMBLE.to_string(),
            versions: SUPPORTED_VERSIONS.to_vec(),
            timeout: None,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
        }
    }
}

/// Runs the one-shot header exchange that opens every connection.
///
/// Both peers write `"<preamble> <role> <v1,v2,...>\n"` and read the other
/// side's line concurrently, then independently compute the same negotiated
/// version from the two lists.
#[derive(Debug, Clone)]
pub struct Handshaker {
    role: Role,
    config: HandshakeConfig,
}

impl Handshaker {
    pub fn new(role: Role, config: HandshakeConfig) -> Self {
        Self { role, config }
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Our header line, newline included.
    pub fn header(&self) -> String {
        let versions = self
            .config
            .versions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("{} {} {}\n", self.config.preamble, self.role, versions)
    }

    /// Exchange header lines and negotiate a version.
    ///
    /// The peer's line is read one byte at a time so nothing after its
    /// newline is consumed; the first frame starts at the next byte.
    pub async fn run<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<ProtoVersion, HandshakeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let exchange = self.exchange(reader, writer);
        let line = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| HandshakeError::Timeout(limit))??,
            None => exchange.await?,
        };

        let version = self.validate(&line)?;
        debug!(role = %self.role, %version, "handshake complete");
        Ok(version)
    }

    async fn exchange<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<String, HandshakeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let header = self.header();
        let write = async {
            writer.write_all(header.as_bytes()).await?;
            writer.flush().await
        };
        let read = read_header(reader, self.config.max_header_len);

        // Neither side may wait for the other: both peers write first.
        let (written, line) = tokio::join!(write, read);
        written.map_err(HandshakeError::Write)?;
        line
    }

    /// Check a peer header line (without its newline) and pick a version.
    pub fn validate(&self, line: &str) -> Result<ProtoVersion, HandshakeError> {
        let parts: Vec<&str> = line.split(' ').collect();
        let [preamble, role, versions] = parts.as_slice() else {
            return Err(HandshakeError::InvalidHeader(format!(
                "expected 3 fields, got {}: '{line}'",
                parts.len()
            )));
        };

        if *preamble != self.config.preamble {
            return Err(HandshakeError::InvalidHeader(format!(
                "unknown preamble '{preamble}' (expected '{}')",
                self.config.preamble
            )));
        }

        match role.parse::<Role>() {
            Ok(peer) if peer == self.role.peer() => {}
            _ => return Err(HandshakeError::WrongRole((*role).to_string())),
        }

        let theirs = versions
            .split(',')
            .map(|token| {
                token
                    .parse::<ProtoVersion>()
                    .map_err(|_| HandshakeError::InvalidVersion(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        select_version(&self.config.versions, &theirs)
    }
}

/// Pick the version both peers will speak.
///
/// Walks our versions from most to least preferred (last to first) and, for
/// each, the peer's versions the same way. The first pair sharing a major
/// decides: the lower of the two minors wins. Both peers arrive at the same
/// answer for the common single-major case.
pub fn select_version(
    ours: &[ProtoVersion],
    theirs: &[ProtoVersion],
) -> Result<ProtoVersion, HandshakeError> {
    for our in ours.iter().rev() {
        for their in theirs.iter().rev() {
            if our.major == their.major {
                return Ok(if our.minor < their.minor { *our } else { *their });
            }
        }
    }
    Err(HandshakeError::UnsupportedVersion {
        ours: ours.to_vec(),
        theirs: theirs.to_vec(),
    })
}

async fn read_header<R>(reader: &mut R, max_len: usize) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte).await {
            Ok(0) => return Err(HandshakeError::Closed),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(HandshakeError::Read(err)),
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= max_len {
            return Err(HandshakeError::InvalidHeader(format!(
                "header longer than {max_len} bytes"
            )));
        }
        line.push(byte[0]);
    }

    String::from_utf8(line)
        .map_err(|_| HandshakeError::InvalidHeader("header is not valid UTF-8".to_string()))
}
