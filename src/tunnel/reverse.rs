//! Reverse tunnel: remote listener on the sshd -> local TCP dial -> shovel
//!
//! The client asks the peer to listen (`tcpip-forward`); peer-initiated
//! streams then arrive through the session's channel-open callback, which
//! looks up the local target in the per-session registry. No accept deadline
//! is needed here: cancellability comes from session close, which surfaces
//! EOF to every wrapping channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::idle::IdleStream;
use super::shovel::ShovelPair;
use super::{StatsSnapshot, TunnelStats};
use crate::error::TunnelError;
use crate::session::SessionHandle;

/// Reverse tunnel endpoints: the sshd listens on `remote_host:remote_port`,
/// and each inbound stream is forwarded to `local_host:local_port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseSpec {
    /// Bind address on the sshd side, e.g. "0.0.0.0"
    pub remote_host: String,
    /// Port to bind remotely (0 lets the sshd choose)
    pub remote_port: u16,
    /// Local endpoint dialed for each inbound stream
    pub local_host: String,
    pub local_port: u16,
}

impl ReverseSpec {
    pub fn new(
        remote_host: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local_host: local_host.into(),
            local_port,
        }
    }

    fn local_label(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Where to deliver streams arriving for one remote listener.
#[derive(Clone)]
pub struct ReverseTarget {
    pub local_host: String,
    pub local_port: u16,
    pub stats: Arc<TunnelStats>,
}

/// Per-session mapping from (remote bind address, bound port) to the local
/// target. The channel-open callback consults it when the sshd delivers a
/// forwarded stream.
#[derive(Default)]
pub struct ReverseRegistry {
    forwards: RwLock<HashMap<(String, u16), ReverseTarget>>,
}

impl ReverseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        remote_host: String,
        bound_port: u16,
        local_host: String,
        local_port: u16,
    ) -> Arc<TunnelStats> {
        let stats = Arc::new(TunnelStats::new());
        self.forwards.write().insert(
            (remote_host, bound_port),
            ReverseTarget {
                local_host,
                local_port,
                stats: stats.clone(),
            },
        );
        stats
    }

    pub fn unregister(&self, remote_host: &str, bound_port: u16) {
        self.forwards
            .write()
            .remove(&(remote_host.to_string(), bound_port));
    }

    pub fn lookup(&self, remote_host: &str, bound_port: u16) -> Option<ReverseTarget> {
        self.forwards
            .read()
            .get(&(remote_host.to_string(), bound_port))
            .cloned()
    }
}

/// Handle to a running reverse tunnel.
pub struct ReverseTunnel {
    pub spec: ReverseSpec,
    /// Port actually bound on the sshd (differs when 0 was requested)
    pub bound_port: u16,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: Arc<TunnelStats>,
}

impl ReverseTunnel {
    /// Cancel the remote listener and unregister the target.
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

/// Issue the remote-listen request and register the local target.
pub async fn start_reverse(
    session: &SessionHandle,
    spec: ReverseSpec,
) -> Result<ReverseTunnel, TunnelError> {
    let controller = session.controller();
    let bound_port = controller
        .tcpip_forward(&spec.remote_host, spec.remote_port as u32)
        .await? as u16;

    info!(
        remote = format!("{}:{}", spec.remote_host, bound_port),
        local = %spec.local_label(),
        sshd = session.label(),
        "reverse tunnel established"
    );

    let registry = session.registry();
    let stats = registry.register(
        spec.remote_host.clone(),
        bound_port,
        spec.local_host.clone(),
        spec.local_port,
    );

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    // monitor: on stop or session halt, cancel the remote listener and
    // unregister so late channel opens are refused
    {
        let running = running.clone();
        let mut halt_rx = session.subscribe_halt();
        let remote_host = spec.remote_host.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!(remote = %remote_host, bound_port, "reverse tunnel stopped by request");
                    if let Err(e) = controller
                        .cancel_tcpip_forward(&remote_host, bound_port as u32)
                        .await
                    {
                        warn!(error = %e, "failed to cancel remote forward");
                    }
                }
                _ = halt_rx.recv() => {
                    debug!(remote = %remote_host, bound_port, "reverse tunnel stopped: session halted");
                }
            }
            running.store(false, Ordering::SeqCst);
            registry.unregister(&remote_host, bound_port);
        });
    }

    Ok(ReverseTunnel {
        spec,
        bound_port,
        running,
        stop_tx,
        stats,
    })
}

/// Serve one peer-initiated stream: dial the local target and shovel.
/// Called from the session's channel-open callback.
pub(crate) async fn serve_forwarded_channel(
    channel: Channel<Msg>,
    target: ReverseTarget,
    originator: String,
    idle_timeout: Duration,
    quiet: bool,
) -> Result<(), TunnelError> {
    target.stats.connection_opened();
    let result = bridge_to_local(channel, &target, &originator, idle_timeout, quiet).await;
    target.stats.connection_closed();
    result
}

async fn bridge_to_local(
    channel: Channel<Msg>,
    target: &ReverseTarget,
    originator: &str,
    idle_timeout: Duration,
    quiet: bool,
) -> Result<(), TunnelError> {
    let local_addr = format!("{}:{}", target.local_host, target.local_port);
    let local_stream = TcpStream::connect(&local_addr).await.map_err(|e| {
        TunnelError::ConnectionFailed(format!("local dial to '{}' failed: {}", local_addr, e))
    })?;
    if let Err(e) = local_stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY");
    }

    if quiet {
        debug!(%originator, local = %local_addr, "accepted reverse connection");
    } else {
        info!(%originator, local = %local_addr, "accepted reverse connection");
    }

    let remote = IdleStream::with_timeout(channel.into_stream(), idle_timeout);
    let pair = ShovelPair::start(
        remote,
        local_stream,
        &format!("{}->{}", originator, local_addr),
        &format!("{}->{}", local_addr, originator),
    );
    pair.wait().await;

    debug!(%originator, "reverse connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_lookup_unregister() {
        let registry = ReverseRegistry::new();

        registry.register("0.0.0.0".into(), 9000, "localhost".into(), 3000);

        let target = registry.lookup("0.0.0.0", 9000).unwrap();
        assert_eq!(target.local_host, "localhost");
        assert_eq!(target.local_port, 3000);

        registry.unregister("0.0.0.0", 9000);
        assert!(registry.lookup("0.0.0.0", 9000).is_none());
    }

    #[test]
    fn test_registry_lookup_misses_other_ports() {
        let registry = ReverseRegistry::new();
        registry.register("0.0.0.0".into(), 9000, "localhost".into(), 3000);
        assert!(registry.lookup("0.0.0.0", 9001).is_none());
        assert!(registry.lookup("127.0.0.1", 9000).is_none());
    }

    #[test]
    fn test_spec_round_trips_through_json() {
        let spec = ReverseSpec::new("0.0.0.0", 9000, "localhost", 3000);
        let json = serde_json::to_string(&spec).unwrap();
        let back: ReverseSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.remote_port, 9000);
        assert_eq!(back.local_label(), "localhost:3000");
    }
}
