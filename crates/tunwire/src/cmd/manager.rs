use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};
use tunwire_speaker::{ManagerSpeaker, Role};
use tunwire_transport::{DuplexPipe, HostPipes};

use crate::cmd::{parse_duration, runtime, Context, ManagerArgs};
use crate::exit::{
    speaker_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT,
};
use crate::output::print_report;
use crate::session::{self, SessionOptions, SessionReport};

pub fn run(args: ManagerArgs, ctx: Context) -> CliResult<i32> {
    let exit_timeout = parse_duration(&args.exit_timeout)?;
    let options = SessionOptions {
        coder_url: args.session.coder_url.clone(),
        api_token: args.session.api_token.clone(),
        speaker: args.timeouts.speaker_config()?,
    };

    runtime()?.block_on(async move {
        let HostPipes { local, remote } = HostPipes::new()
            .map_err(|err| transport_error("failed to create tunnel pipes", err))?;
        remote
            .set_inheritable(true)
            .map_err(|err| transport_error("failed to share pipes with daemon", err))?;

        let mut command = Command::new(&args.daemon);
        command
            .arg("--log-format")
            .arg(ctx.log_format.as_arg())
            .arg("--log-level")
            .arg(ctx.log_level.as_arg())
            .arg("tunnel")
            .arg("--read-fd")
            .arg(remote.read_fd().to_string())
            .arg("--write-fd")
            .arg(remote.write_fd().to_string())
            .arg("--handshake-timeout")
            .arg(&args.timeouts.handshake_timeout);
        if let Some(rpc_timeout) = &args.timeouts.rpc_timeout {
            command.arg("--rpc-timeout").arg(rpc_timeout);
        }
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CliError::new(
                    FAILURE,
                    format!("failed to spawn {}: {err}", args.daemon.display()),
                )
            })?;
        // The child holds its own copies now. Ours must go so that its exit
        // reads as end-of-stream here.
        drop(remote);
        info!(pid = child.id(), daemon = %args.daemon.display(), "spawned tunnel daemon");

        let daemon = args.daemon.display().to_string();
        let report = tokio::select! {
            report = run_session(local, &daemon, &options) => report?,
            _ = tokio::signal::ctrl_c() => {
                return Err(CliError::new(FAILURE, "interrupted"));
            }
        };

        let exited = wait_for_exit(&mut child, exit_timeout).await;
        print_report(&report, ctx.format);
        exited.map(|()| SUCCESS)
    })
}

async fn run_session(
    local: DuplexPipe,
    daemon: &str,
    options: &SessionOptions,
) -> CliResult<SessionReport> {
    let mut speaker =
        ManagerSpeaker::with_config(Role::Manager, local.into(), options.speaker.clone());
    let version = speaker
        .handshake()
        .await
        .map_err(|err| speaker_error("handshake with tunnel daemon failed", err))?;
    info!(%version, "connected to tunnel daemon");
    session::drive(speaker, daemon, options).await
}

async fn wait_for_exit(child: &mut Child, limit: Duration) -> CliResult<()> {
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(CliError::new(
            FAILURE,
            format!("tunnel daemon exited with {status}"),
        )),
        Ok(Err(err)) => Err(CliError::new(
            FAILURE,
            format!("failed to wait for tunnel daemon: {err}"),
        )),
        Err(_) => {
            warn!(?limit, "tunnel daemon did not exit, killing it");
            let _ = child.kill().await;
            Err(CliError::new(
                TIMEOUT,
                format!("tunnel daemon did not exit within {limit:?}"),
            ))
        }
    }
}
