use tracing::{debug, info};
use tunwire_speaker::{Role, TunnelSpeaker};
use tunwire_transport::DuplexPipe;

use crate::cmd::{runtime, TunnelArgs};
use crate::exit::{speaker_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::session;

pub fn run(args: TunnelArgs) -> CliResult<i32> {
    if args.read_fd == args.write_fd && args.read_fd >= 0 {
        return Err(CliError::new(
            USAGE,
            "--read-fd and --write-fd must be different descriptors",
        ));
    }
    let config = args.timeouts.speaker_config()?;

    runtime()?.block_on(async move {
        // SAFETY: the descriptors were passed to this process for its exclusive
        // use, are distinct, and nothing else here opens or closes them.
        let pipe = unsafe { DuplexPipe::from_raw_fds(args.read_fd, args.write_fd) }
            .map_err(|err| transport_error("failed to adopt pipe descriptors", err))?;

        let mut speaker = TunnelSpeaker::with_config(Role::Tunnel, pipe.into(), config);
        let version = speaker
            .handshake()
            .await
            .map_err(|err| speaker_error("handshake with manager failed", err))?;
        info!(%version, "connected to manager");

        tokio::select! {
            served = session::serve(&speaker) => {
                let served = served?;
                info!(served, "manager session ended");
                Ok(SUCCESS)
            }
            _ = tokio::signal::ctrl_c() => {
                if let Err(err) = speaker.close().await {
                    debug!(error = %err, "close after interrupt failed");
                }
                Err(CliError::new(FAILURE, "interrupted"))
            }
        }
    })
}
