//! Manager and tunnel in one process over an anonymous pipe pair.
//!
//! Run with:
//!   cargo run --example loopback
//!
//! The manager asks for a peer update; the tunnel answers and logs a line
//! back as a one-way message.

use tunwire::speaker::proto::{GetPeerUpdate, Log, LogLevel, PeerUpdate, Workspace};
use tunwire::speaker::{
    IncomingMessage, ManagerMessage, ManagerPayload, ManagerSpeaker, Role, TunnelMessage,
    TunnelPayload, TunnelSpeaker,
};
use tunwire::transport::DuplexPipe;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (left, right) = DuplexPipe::pair()?;
    let mut manager = ManagerSpeaker::new(Role::Manager, left.into());
    let mut tunnel = TunnelSpeaker::new(Role::Tunnel, right.into());

    let (m, t) = tokio::join!(manager.handshake(), tunnel.handshake());
    eprintln!("negotiated codervpn {}", m?);
    t?;

    let daemon = tokio::spawn(async move {
        let mut incoming = tunnel.incoming()?;
        while let Some(event) = incoming.next().await {
            let IncomingMessage::Rpc(request) = event else {
                continue;
            };
            if let ManagerPayload::GetPeerUpdate(_) = request.message().msg {
                let log = Log::new(LogLevel::Info, "sending peer update");
                tunnel.send(&TunnelMessage::new(log)).await?;
                let update = PeerUpdate {
                    upserted_workspaces: vec![Workspace {
                        id: "ws-1".into(),
                        name: "dev".into(),
                        ..Workspace::default()
                    }],
                    ..PeerUpdate::default()
                };
                request.reply(TunnelMessage::new(update)).await?;
                break;
            }
        }
        tunnel.close().await
    });

    let mut incoming = manager.incoming()?;
    let reply = manager
        .unary_rpc(ManagerMessage::new(GetPeerUpdate {}))
        .await?;
    if let TunnelPayload::PeerUpdate(update) = reply.msg {
        for ws in update.upserted_workspaces {
            eprintln!("workspace {} ({})", ws.name, ws.id);
        }
    }

    daemon.await??;
    while let Some(event) = incoming.next().await {
        if let IncomingMessage::Message(TunnelMessage {
            msg: TunnelPayload::Log(log),
            ..
        }) = event
        {
            eprintln!("tunnel said: {}", log.message);
        }
    }
    manager.close().await?;
    Ok(())
}
