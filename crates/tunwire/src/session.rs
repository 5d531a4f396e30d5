//! The reference manager session and tunnel daemon loop shared by the
//! `manager`, `tunnel` and `loopback` commands.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use tunwire_speaker::proto::{
    DnsSettings, GetPeerUpdate, Ipv6Route, Ipv6Settings, Log, LogLevel, NetworkSettingsRequest,
    NetworkSettingsResponse, PeerUpdate, StartRequest, StartResponse, StopRequest, StopResponse,
};
use tunwire_speaker::{
    IncomingMessage, ManagerMessage, ManagerPayload, ManagerSpeaker, SpeakerConfig, TunnelMessage,
    TunnelPayload, TunnelSpeaker,
};

use crate::exit::{speaker_error, CliError, CliResult, INTERNAL, PROTOCOL};

/// How long the manager waits for the tunnel to hang up after a stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const TUNNEL_MTU: u32 = 1280;
const TUNNEL_ADDRESS: &str = "fd60:627a:a42b:1::1";

/// What the manager asks the tunnel to do.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub coder_url: String,
    pub api_token: String,
    pub speaker: SpeakerConfig,
}

/// Outcome of one start / peer-update / stop session, from the manager's side.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub daemon: String,
    pub protocol_version: String,
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_error: Option<String>,
    pub network_settings_requests: usize,
    pub tunnel_logs: Vec<String>,
    pub workspaces: usize,
    pub agents: usize,
    pub stopped: bool,
    pub elapsed_ms: f64,
}

#[derive(Debug, Default)]
struct InboundTally {
    network_settings_requests: usize,
    tunnel_logs: Vec<String>,
}

/// Run a full session as the manager over an already-handshaken speaker.
pub async fn drive(
    speaker: ManagerSpeaker,
    daemon: &str,
    options: &SessionOptions,
) -> CliResult<SessionReport> {
    let started_at = Instant::now();
    let protocol_version = speaker
        .version()
        .map(|v| v.to_string())
        .unwrap_or_default();

    let mut incoming = speaker
        .incoming()
        .map_err(|err| speaker_error("failed to read from tunnel", err))?;
    let inbound = tokio::spawn(async move {
        let mut tally = InboundTally::default();
        while let Some(event) = incoming.next().await {
            match event {
                IncomingMessage::Message(TunnelMessage {
                    msg: TunnelPayload::Log(log),
                    ..
                }) => {
                    info!(level = ?log.level, message = %log.message, "tunnel log");
                    tally.tunnel_logs.push(log.message);
                }
                IncomingMessage::Message(other) => {
                    debug!(message = ?other.msg, "ignoring one-way tunnel message");
                }
                IncomingMessage::Rpc(request) => {
                    let response = match &request.message().msg {
                        TunnelPayload::NetworkSettings(settings) => {
                            tally.network_settings_requests += 1;
                            info!(
                                mtu = settings.mtu,
                                remote = %settings.tunnel_remote_address,
                                "applying network settings"
                            );
                            NetworkSettingsResponse::ok()
                        }
                        other => NetworkSettingsResponse::failed(format!(
                            "unexpected request: {other:?}"
                        )),
                    };
                    if let Err(err) = request.reply(ManagerMessage::new(response)).await {
                        warn!(error = %err, "failed to answer tunnel request");
                    }
                }
            }
        }
        tally
    });

    let start = ManagerMessage::new(StartRequest {
        tunnel_file_descriptor: -1,
        coder_url: options.coder_url.clone(),
        api_token: options.api_token.clone(),
        headers: Vec::new(),
    });
    let start = match call(&speaker, start, "start").await? {
        TunnelPayload::Start(resp) => resp,
        other => return Err(unexpected("start", &other)),
    };
    if start.success {
        info!("tunnel started");
    } else {
        warn!(error = %start.error_message, "tunnel failed to start");
    }

    let request = ManagerMessage::new(GetPeerUpdate {});
    let update = match call(&speaker, request, "peer update").await? {
        TunnelPayload::PeerUpdate(update) => update,
        other => return Err(unexpected("peer update", &other)),
    };

    let stop = match call(&speaker, ManagerMessage::new(StopRequest {}), "stop").await? {
        TunnelPayload::Stop(resp) => resp,
        other => return Err(unexpected("stop", &other)),
    };

    speaker
        .close_write()
        .await
        .map_err(|err| speaker_error("failed to close write half", err))?;

    // The tunnel hangs up after answering a stop; don't wait on it forever.
    let inbound = tokio::time::timeout(DRAIN_TIMEOUT, inbound);
    let tally = match inbound.await {
        Ok(joined) => inbound_tally(joined)?,
        Err(_) => {
            warn!(timeout = ?DRAIN_TIMEOUT, "tunnel did not hang up after stop");
            speaker.close_read();
            InboundTally::default()
        }
    };

    Ok(SessionReport {
        daemon: daemon.to_string(),
        protocol_version,
        started: start.success,
        start_error: (!start.success).then_some(start.error_message),
        network_settings_requests: tally.network_settings_requests,
        tunnel_logs: tally.tunnel_logs,
        workspaces: update.upserted_workspaces.len(),
        agents: update.upserted_agents.len(),
        stopped: stop.success,
        elapsed_ms: (started_at.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
    })
}

fn inbound_tally(
    joined: Result<InboundTally, tokio::task::JoinError>,
) -> CliResult<InboundTally> {
    joined.map_err(|err| {
        warn!(error = %err, "tunnel event task failed");
        CliError::new(INTERNAL, format!("tunnel event task failed: {err}"))
    })
}

async fn call(
    speaker: &ManagerSpeaker,
    request: ManagerMessage,
    what: &str,
) -> CliResult<TunnelPayload> {
    speaker
        .unary_rpc(request)
        .await
        .map(|reply| reply.msg)
        .map_err(|err| speaker_error(&format!("{what} request failed"), err))
}

fn unexpected(what: &str, payload: &TunnelPayload) -> CliError {
    CliError::new(
        PROTOCOL,
        format!("unexpected reply to {what} request: {payload:?}"),
    )
}

/// Serve manager requests as the tunnel daemon until stopped or hung up.
///
/// Every request gets a reply, a failed one if it makes no sense here.
/// Returns the number of requests answered.
pub async fn serve(speaker: &TunnelSpeaker) -> CliResult<usize> {
    let mut incoming = speaker
        .incoming()
        .map_err(|err| speaker_error("failed to read from manager", err))?;
    let mut served = 0;

    while let Some(event) = incoming.next().await {
        let request = match event {
            IncomingMessage::Rpc(request) => request,
            IncomingMessage::Message(msg) => {
                debug!(message = ?msg.msg, "ignoring one-way manager message");
                continue;
            }
        };

        let mut stopping = false;
        let response = match &request.message().msg {
            ManagerPayload::Start(start) => TunnelMessage::new(start_tunnel(speaker, start).await),
            // No coordinator behind this daemon, so there are never any peers.
            ManagerPayload::GetPeerUpdate(_) => TunnelMessage::new(PeerUpdate::default()),
            ManagerPayload::Stop(_) => {
                stopping = true;
                TunnelMessage::new(StopResponse::ok())
            }
            // The manager is still waiting on this id, so it gets an answer.
            ManagerPayload::NetworkSettings(_) => {
                warn!(id = request.id(), "network settings response sent as a request");
                TunnelMessage::new(StopResponse::failed(
                    "unexpected request: network settings response",
                ))
            }
        };

        request
            .reply(response)
            .await
            .map_err(|err| speaker_error("failed to answer manager", err))?;
        served += 1;

        if stopping {
            info!("tunnel stopped");
            speaker
                .close_write()
                .await
                .map_err(|err| speaker_error("failed to close write half", err))?;
            break;
        }
    }

    Ok(served)
}

async fn start_tunnel(speaker: &TunnelSpeaker, start: &StartRequest) -> StartResponse {
    if start.coder_url.is_empty() {
        return StartResponse::failed("missing coder url");
    }

    let log =
        Log::new(LogLevel::Info, "starting tunnel").with_field("coder_url", &start.coder_url);
    if let Err(err) = speaker.send(&TunnelMessage::new(log)).await {
        return StartResponse::failed(format!("failed to log to manager: {err}"));
    }

    match speaker
        .unary_rpc(TunnelMessage::new(network_settings()))
        .await
    {
        Ok(ManagerMessage {
            msg: ManagerPayload::NetworkSettings(resp),
            ..
        }) if resp.success => StartResponse::ok(),
        Ok(ManagerMessage {
            msg: ManagerPayload::NetworkSettings(resp),
            ..
        }) => StartResponse::failed(format!(
            "manager rejected network settings: {}",
            resp.error_message
        )),
        Ok(other) => StartResponse::failed(format!("unexpected reply: {:?}", other.msg)),
        Err(err) => StartResponse::failed(format!("network settings request failed: {err}")),
    }
}

fn network_settings() -> NetworkSettingsRequest {
    NetworkSettingsRequest {
        tunnel_overhead_bytes: 0,
        mtu: TUNNEL_MTU,
        tunnel_remote_address: TUNNEL_ADDRESS.to_string(),
        dns_settings: Some(DnsSettings {
            servers: vec![TUNNEL_ADDRESS.to_string()],
            match_domains: vec!["coder".to_string()],
            ..DnsSettings::default()
        }),
        ipv4_settings: None,
        ipv6_settings: Some(Ipv6Settings {
            addrs: vec![TUNNEL_ADDRESS.to_string()],
            prefix_lengths: vec![128],
            included_routes: vec![Ipv6Route {
                destination: "fd60:627a:a42b::".to_string(),
                prefix_length: 48,
                router: String::new(),
            }],
            excluded_routes: Vec::new(),
        }),
    }
}
