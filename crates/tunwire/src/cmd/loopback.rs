use tracing::{info, warn};
use tunwire_speaker::{ManagerSpeaker, Role, TunnelSpeaker};
use tunwire_transport::DuplexPipe;

use crate::cmd::{runtime, LoopbackArgs};
use crate::exit::{speaker_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_report, OutputFormat};
use crate::session::{self, SessionOptions};

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    let options = SessionOptions {
        coder_url: args.session.coder_url,
        api_token: args.session.api_token,
        speaker: args.timeouts.speaker_config()?,
    };

    runtime()?.block_on(async move {
        let (left, right) =
            DuplexPipe::pair().map_err(|err| transport_error("failed to create pipes", err))?;
        let mut manager =
            ManagerSpeaker::with_config(Role::Manager, left.into(), options.speaker.clone());
        let mut tunnel =
            TunnelSpeaker::with_config(Role::Tunnel, right.into(), options.speaker.clone());

        let (m, t) = tokio::join!(manager.handshake(), tunnel.handshake());
        let version = m.map_err(|err| speaker_error("manager handshake failed", err))?;
        t.map_err(|err| speaker_error("tunnel handshake failed", err))?;
        info!(%version, "loopback connected");

        let daemon = tokio::spawn(async move {
            let served = session::serve(&tunnel).await;
            (served, tunnel)
        });

        let report = session::drive(manager, "loopback", &options).await?;

        let (served, _tunnel) = daemon
            .await
            .map_err(|err| CliError::new(INTERNAL, format!("tunnel task failed: {err}")))?;
        match served {
            Ok(served) => info!(served, "tunnel finished"),
            Err(err) => warn!(error = %err, "tunnel ended with an error"),
        }

        print_report(&report, format);
        Ok(SUCCESS)
    })
}
