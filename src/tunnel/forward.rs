//! Forward tunnel: local TCP listener -> direct-tcpip channel -> shovel pair
//!
//! Accepted connections are fire-and-forget: each one gets its own channel
//! and pump pair, and a per-connection failure never brings down the accept
//! loop or the session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::idle::IdleStream;
use super::shovel::ShovelPair;
use super::{StatsSnapshot, TunnelStats};
use crate::error::TunnelError;
use crate::session::{SessionController, SessionHandle};

/// Accept deadline: an expiry is a timer tick that re-polls the shutdown
/// signal, so a cooperative stop is observed promptly even with no traffic.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Forward tunnel endpoints: listen locally, forward to `remote_host:port`
/// via the sshd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSpec {
    /// Local address to bind, e.g. "127.0.0.1:8888"
    pub listen_addr: String,
    /// Remote endpoint the sshd dials for each connection
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    pub fn new(
        listen_addr: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    fn remote_label(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Handle to a running forward tunnel.
pub struct ForwardTunnel {
    pub spec: ForwardSpec,
    /// Actual bound address (differs from the requested one when port 0 was
    /// asked for)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: Arc<TunnelStats>,
}

impl ForwardTunnel {
    /// Ask the accept loop to exit. Connections already shoveling drain on
    /// their own.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Bind the local listener and spawn the accept task.
pub async fn start_forward(
    session: &SessionHandle,
    spec: ForwardSpec,
) -> Result<ForwardTunnel, TunnelError> {
    let listener = TcpListener::bind(&spec.listen_addr).await.map_err(|e| {
        match e.kind() {
            std::io::ErrorKind::AddrInUse => TunnelError::ConnectionFailed(format!(
                "could not listen on {}: address already in use",
                spec.listen_addr
            )),
            std::io::ErrorKind::PermissionDenied => TunnelError::ConnectionFailed(format!(
                "could not listen on {}: permission denied (ports below 1024 need privileges)",
                spec.listen_addr
            )),
            _ => TunnelError::ConnectionFailed(format!(
                "could not listen on {}: {}",
                spec.listen_addr, e
            )),
        }
    })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::ConnectionFailed(format!("no bound address: {}", e)))?;

    info!(
        local = %bound_addr,
        remote = %spec.remote_label(),
        sshd = session.label(),
        "forward tunnel listening"
    );

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
    let stats = Arc::new(TunnelStats::new());

    tokio::spawn(accept_loop(
        listener,
        spec.clone(),
        session.controller(),
        session.subscribe_halt(),
        stop_rx,
        running.clone(),
        stats.clone(),
        session.idle_timeout(),
        session.quiet(),
    ));

    Ok(ForwardTunnel {
        spec,
        bound_addr,
        running,
        stop_tx,
        stats,
    })
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    spec: ForwardSpec,
    controller: SessionController,
    mut halt_rx: tokio::sync::broadcast::Receiver<()>,
    mut stop_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
    stats: Arc<TunnelStats>,
    idle_timeout: Duration,
    quiet: bool,
) {
    loop {
        tokio::select! {
            _ = halt_rx.recv() => {
                debug!(local = %spec.listen_addr, "forward tunnel stopped: session halted");
                break;
            }
            _ = stop_rx.recv() => {
                debug!(local = %spec.listen_addr, "forward tunnel stopped by request");
                break;
            }
            accepted = tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()) => {
                match accepted {
                    // deadline expired: treat as a timer tick and re-poll
                    // the shutdown signals
                    Err(_elapsed) => {
                        debug!(local = %spec.listen_addr, "accept deadline tick");
                        continue;
                    }
                    Ok(Ok((stream, peer_addr))) => {
                        if quiet {
                            debug!(peer = %peer_addr, remote = %spec.remote_label(), "accepted forward connection");
                        } else {
                            info!(peer = %peer_addr, remote = %spec.remote_label(), "accepted forward connection");
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(error = %e, "failed to set TCP_NODELAY");
                        }

                        let controller = controller.clone();
                        let spec = spec.clone();
                        let stats = stats.clone();
                        tokio::spawn(async move {
                            stats.connection_opened();
                            if let Err(e) =
                                serve_connection(controller, stream, peer_addr, &spec, idle_timeout).await
                            {
                                // the accept loop survives per-connection failures
                                warn!(peer = %peer_addr, error = %e, "forward connection failed");
                            }
                            stats.connection_closed();
                        });
                    }
                    Ok(Err(e)) => {
                        error!(local = %spec.listen_addr, error = %e, "accept failed, forward tunnel exiting");
                        break;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!(local = %spec.listen_addr, "forward accept task exited");
}

/// One accepted connection: open the channel, shovel until either side
/// closes.
async fn serve_connection(
    controller: SessionController,
    stream: TcpStream,
    peer_addr: SocketAddr,
    spec: &ForwardSpec,
    idle_timeout: Duration,
) -> Result<(), TunnelError> {
    let channel = controller
        .open_direct_tcpip(
            &spec.remote_host,
            spec.remote_port as u32,
            &peer_addr.ip().to_string(),
            peer_addr.port() as u32,
        )
        .await?;

    let remote = IdleStream::with_timeout(channel.into_stream(), idle_timeout);
    let remote_label = spec.remote_label();
    let pair = ShovelPair::start(
        stream,
        remote,
        &format!("{}->{}", peer_addr, remote_label),
        &format!("{}->{}", remote_label, peer_addr),
    );
    pair.wait().await;

    debug!(peer = %peer_addr, "forward connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_round_trips_through_json() {
        let spec = ForwardSpec::new("127.0.0.1:8888", "internal.example", 8080);
        let json = serde_json::to_string(&spec).unwrap();
        let back: ForwardSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.listen_addr, "127.0.0.1:8888");
        assert_eq!(back.remote_label(), "internal.example:8080");
    }

    #[test]
    fn test_accept_poll_interval_is_ten_seconds() {
        assert_eq!(ACCEPT_POLL_INTERVAL, Duration::from_secs(10));
    }
}
