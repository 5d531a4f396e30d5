use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use tunwire_speaker::{HandshakeConfig, SpeakerConfig};

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::logging::{LogFormat, LogLevel};
use crate::output::OutputFormat;

pub mod loopback;
pub mod manager;
pub mod tunnel;
pub mod version;

/// Default coordinator URL handed to the tunnel in the start request.
const DEFAULT_CODER_URL: &str = "https://coder.example.com";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show version information.
    Version(VersionArgs),
    /// Run as the tunnel daemon on inherited pipe descriptors.
    Tunnel(TunnelArgs),
    /// Spawn a tunnel daemon and drive a start/peer-update/stop session.
    Manager(ManagerArgs),
    /// Run manager and tunnel in this process over an in-process pipe pair.
    Loopback(LoopbackArgs),
}

/// Global flags every command may need.
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub format: OutputFormat,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

pub fn run(command: Command, ctx: Context) -> CliResult<i32> {
    match command {
        Command::Version(args) => version::run(args),
        Command::Tunnel(args) => tunnel::run(args),
        Command::Manager(args) => manager::run(args, ctx),
        Command::Loopback(args) => loopback::run(args, ctx.format),
    }
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug)]
pub struct TunnelArgs {
    /// Inherited descriptor to read manager messages from.
    #[arg(long, value_name = "FD", allow_negative_numbers = true)]
    pub read_fd: i32,
    /// Inherited descriptor to write tunnel messages to.
    #[arg(long, value_name = "FD", allow_negative_numbers = true)]
    pub write_fd: i32,
    #[command(flatten)]
    pub timeouts: TimeoutArgs,
}

#[derive(Args, Debug)]
pub struct ManagerArgs {
    /// Tunnel daemon executable. It is started as `DAEMON tunnel --read-fd R --write-fd W`.
    pub daemon: PathBuf,
    #[command(flatten)]
    pub session: SessionArgs,
    #[command(flatten)]
    pub timeouts: TimeoutArgs,
    /// How long to wait for the daemon to exit after the session (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub exit_timeout: String,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    #[command(flatten)]
    pub session: SessionArgs,
    #[command(flatten)]
    pub timeouts: TimeoutArgs,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    /// Coordinator URL sent in the start request.
    #[arg(long, default_value = DEFAULT_CODER_URL)]
    pub coder_url: String,
    /// API token sent in the start request.
    #[arg(long, env = "TUNWIRE_API_TOKEN", default_value = "", hide_env_values = true)]
    pub api_token: String,
}

#[derive(Args, Debug)]
pub struct TimeoutArgs {
    /// Bound on the version handshake (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub handshake_timeout: String,
    /// Bound on each unary call. Unbounded when omitted.
    #[arg(long)]
    pub rpc_timeout: Option<String>,
}

impl TimeoutArgs {
    pub fn speaker_config(&self) -> CliResult<SpeakerConfig> {
        let handshake_timeout = parse_duration(&self.handshake_timeout)?;
        let rpc_timeout = self.rpc_timeout.as_deref().map(parse_duration).transpose()?;
        Ok(SpeakerConfig {
            handshake: HandshakeConfig {
                timeout: Some(handshake_timeout),
                ..HandshakeConfig::default()
            },
            rpc_timeout,
            ..SpeakerConfig::default()
        })
    }
}

pub(crate) fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start async runtime", err))
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
