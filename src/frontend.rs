use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tunnel::{TunnelHandle, TunnelState};

/// Runs the TCP reverse-forwarder: accept clients on `listen_addr` and
/// relay their bytes to the backend through the tunnel. No line or schema
/// semantics apply; payloads are opaque.
pub async fn run(
    listen_addr: &str,
    tunnel: TunnelHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding frontend listener on {listen_addr}"))?;
    info!(addr = listen_addr, "frontend listening");

    serve(listener, tunnel, cancel).await
}

/// Accept loop over an already-bound listener. Accepting is gated on the
/// tunnel being connected; while it reconnects, clients wait in the
/// listen backlog.
pub async fn serve(
    listener: TcpListener,
    mut tunnel: TunnelHandle,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = tunnel.wait_connected() => res?,
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            state = tunnel.state_changed() => {
                if state? != TunnelState::Connected {
                    debug!("tunnel down, pausing accepts");
                }
            }
            res = listener.accept() => {
                let (stream, peer) = res.context("accepting frontend client")?;
                info!(%peer, "client connected");
                tokio::spawn(forward_client(
                    stream,
                    tunnel.clone(),
                    cancel.child_token(),
                ));
            }
        }
    }
}

/// Copies one client's bytes into the tunnel until EOF or shutdown.
async fn forward_client(mut stream: TcpStream, tunnel: TunnelHandle, cancel: CancellationToken) {
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            res = stream.read(&mut buf) => res,
        };

        match read {
            Ok(0) => {
                debug!("client closed");
                return;
            }
            Ok(n) => {
                if !tunnel.send(buf[..n].to_vec()).await {
                    warn!("tunnel gone, dropping client");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "client read error");
                return;
            }
        }
    }
}
