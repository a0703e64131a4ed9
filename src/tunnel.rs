use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Maximum buffers queued for the tunnel before `can_send` backpressures.
pub const SEND_QUEUE_CAPACITY: usize = 1024;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Tunnel connection state, published to handles on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connected,
    Reconnecting,
}

/// Handle to the tunnel I/O task: a bounded send queue plus state and
/// drain queries. Cloneable; all clones feed the same connection.
#[derive(Clone)]
pub struct TunnelHandle {
    tx: mpsc::Sender<Vec<u8>>,
    state: watch::Receiver<TunnelState>,
    inflight: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl TunnelHandle {
    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// True when the tunnel is connected and the send queue has headroom.
    /// The worker backs off (and retries on its next tick) otherwise.
    pub fn can_send(&self) -> bool {
        self.state() == TunnelState::Connected && self.tx.capacity() > 0
    }

    /// Enqueues an owned buffer. Buffers enqueued while the tunnel is
    /// down are kept and written after reconnect. Returns false only if
    /// the I/O task is gone.
    pub async fn send(&self, buf: Vec<u8>) -> bool {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(buf).await.is_err() {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// True when every enqueued buffer has been written to the socket.
    pub fn send_complete(&self) -> bool {
        self.inflight.load(Ordering::Acquire) == 0
    }

    /// Dial failures and socket errors since startup. Never terminal;
    /// each one arms the reconnect timer.
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// Waits until the tunnel reports `Connected`.
    pub async fn wait_connected(&mut self) -> Result<()> {
        self.state
            .wait_for(|s| *s == TunnelState::Connected)
            .await
            .context("tunnel task stopped")?;
        Ok(())
    }

    /// Waits for the next state transition (used to gate the TCP
    /// frontend's accept loop).
    pub async fn state_changed(&mut self) -> Result<TunnelState> {
        self.state.changed().await.context("tunnel task stopped")?;
        Ok(*self.state.borrow())
    }
}

/// Spawns the tunnel I/O task connecting to `addr` and returns its handle.
///
/// State machine: Disconnected -> (dial ok) -> Connected; dial failure or
/// a socket error arms a 1 s timer (Reconnecting) and then dials again.
/// Bytes received from the peer are logged and discarded; a zero-length
/// read is peer closure and follows the error path.
pub fn spawn(addr: String, cancel: CancellationToken) -> TunnelHandle {
    let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let (state_tx, state_rx) = watch::channel(TunnelState::Disconnected);
    let inflight = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let handle = TunnelHandle {
        tx,
        state: state_rx,
        inflight: Arc::clone(&inflight),
        errors: Arc::clone(&errors),
    };

    tokio::spawn(run(addr, rx, state_tx, inflight, errors, cancel));

    handle
}

async fn run(
    addr: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
    state_tx: watch::Sender<TunnelState>,
    inflight: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    // Buffer being (re)written; retained across reconnects so an outage
    // loses nothing that was handed to the tunnel.
    let mut pending: Option<Vec<u8>> = None;

    loop {
        state_tx.send_replace(TunnelState::Disconnected);

        let dial = tokio::select! {
            _ = cancel.cancelled() => return,
            res = TcpStream::connect(&addr) => res,
        };

        let mut stream = match dial {
            Ok(stream) => stream,
            Err(e) => {
                errors.fetch_add(1, Ordering::Relaxed);
                warn!(addr, error = %e, "tunnel connect failed");
                state_tx.send_replace(TunnelState::Reconnecting);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };

        info!(addr, "tunnel connected");
        state_tx.send_replace(TunnelState::Connected);

        let err = connection_loop(&mut stream, &mut rx, &mut pending, &inflight, &cancel).await;
        let Some(err) = err else {
            return; // cancelled or all senders gone
        };

        errors.fetch_add(1, Ordering::Relaxed);
        error!(addr, error = %err, "tunnel error");
        state_tx.send_replace(TunnelState::Reconnecting);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Runs one connection until an error (returned) or shutdown (`None`).
async fn connection_loop(
    stream: &mut TcpStream,
    rx: &mut mpsc::Receiver<Vec<u8>>,
    pending: &mut Option<Vec<u8>>,
    inflight: &AtomicUsize,
    cancel: &CancellationToken,
) -> Option<io::Error> {
    let mut discard = [0u8; 1024];

    loop {
        if let Some(buf) = pending.take() {
            match stream.write_all(&buf).await {
                Ok(()) => {
                    inflight.fetch_sub(1, Ordering::AcqRel);
                }
                Err(e) => {
                    *pending = Some(buf);
                    return Some(e);
                }
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            buf = rx.recv() => match buf {
                Some(buf) => *pending = Some(buf),
                None => return None,
            },
            res = stream.read(&mut discard) => match res {
                Ok(0) => return Some(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
                Ok(n) => warn!(bytes = n, "discarding bytes received from tunnel"),
                Err(e) => return Some(e),
            },
        }
    }
}
