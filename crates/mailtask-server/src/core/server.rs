use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use mailtask_proto::{
    ACK, Header, KIND_HEALTH, KIND_HEALTH_REPORT, KIND_PING, decode_header_json,
    encode_header_json, read_frame_async, write_frame_async
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::app::AppState;

const MAX_HEADER_LEN: u32 = 16 * 1024;
const MAX_BODY_LEN: u64 = 64 * 1024;

pub async fn bind_health_listener(listen: &str) -> Result<TcpListener> {
    TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind health listener on {listen}"))
}

/// Serves health queries and spawns one task per accepted client.
///
/// The loop exits only when the shared shutdown token is cancelled.
pub async fn run_health_server(
    listener: TcpListener,
    state: AppState
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("health listener ready: addr={addr}");
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("health listener stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("health accept failed: error={err}");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, peer, state).await {
                        warn!("health client failed: peer={peer}, error={err:#}");
                    }
                });
            }
        }
    }

    Ok(())
}

/// Handles one framed request.
///
/// Supported kinds:
/// - `ping`: ACK only
/// - `health`: `health_report` frame with the JSON report as body
async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: AppState
) -> Result<()> {
    let (header_bytes, _body) = read_frame_async(&mut stream, MAX_HEADER_LEN, MAX_BODY_LEN)
        .await
        .context("failed to read frame")?;

    let header = decode_header_json(&header_bytes).context("failed to decode header")?;

    if header.is_kind(KIND_PING) {
        stream.write_all(ACK).await.context("failed to write ACK")?;
        debug!(
            "ping answered: peer={}, source={}",
            peer,
            header.source.as_deref().unwrap_or("-")
        );
        return Ok(());
    }

    if header.is_kind(KIND_HEALTH) {
        let report = state.orchestrator.get_health();
        let body = serde_json::to_vec(&report).context("failed to encode health report")?;
        let reply = encode_header_json(&Header::new(KIND_HEALTH_REPORT).with_source(&state.source))
            .context("failed to encode reply header")?;

        write_frame_async(&mut stream, &reply, &body)
            .await
            .context("failed to write health report")?;
        debug!(
            "health report sent: peer={}, state={}, ready={}",
            peer, report.state, report.ready
        );
        return Ok(());
    }

    bail!("unsupported frame kind: {}", header.kind)
}
