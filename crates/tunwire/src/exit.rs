use std::fmt;
use std::io;

use tunwire_frame::FrameError;
use tunwire_speaker::{HandshakeError, RpcError, SpeakerError};
use tunwire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const PROTOCOL: i32 = 76;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed | FrameError::Closed => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        FrameError::ShortLength { .. } => CliError::new(PROTOCOL, format!("{context}: {err}")),
    }
}

pub fn speaker_error(context: &str, err: SpeakerError) -> CliError {
    match err {
        SpeakerError::Handshake(HandshakeError::Read(source))
        | SpeakerError::Handshake(HandshakeError::Write(source)) => io_error(context, source),
        SpeakerError::Handshake(HandshakeError::Timeout(_)) | SpeakerError::Timeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        SpeakerError::Handshake(HandshakeError::Closed) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        SpeakerError::Handshake(_) => CliError::new(PROTOCOL, format!("{context}: {err}")),
        SpeakerError::Frame(err) => frame_error(context, err),
        SpeakerError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        SpeakerError::Rpc(RpcError::Shutdown) | SpeakerError::Closed => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        SpeakerError::Rpc(_) => CliError::new(PROTOCOL, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
