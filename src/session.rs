//! Session handle and its single-owner task
//!
//! Exactly one task owns the russh `Handle`; every tunnel talks to it
//! through a cloneable [`SessionController`] over an mpsc channel. This
//! avoids lock contention on the handle, deadlocks from holding locks across
//! `.await`, and protocol violations from concurrent handle access.
//!
//! The session also carries the shutdown *halter*: a broadcast every
//! long-running tunnel task subscribes to. Raising it (or losing the SSH
//! connection) tears the whole session down in bounded time, and shutdown is
//! never reported as an error.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::ClientHandler;
use crate::error::TunnelError;
use crate::tunnel::reverse::ReverseRegistry;

/// Commands accepted by the session owner task
pub enum SessionCommand {
    /// Open a direct-tcpip channel (forward tunnels)
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Ask the peer to listen remotely (reverse tunnels). Replies with the
    /// actually bound port.
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel a remote listener
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Close the SSH connection
    Disconnect,
}

/// Cloneable command sender for the session owner task.
#[derive(Clone)]
pub struct SessionController {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionController {
    pub(crate) fn new(cmd_tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open an outgoing TCP-forwarded channel to `host:port` on the peer.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::ChannelError(e.to_string()))
    }

    /// Request a peer-side TCP listener. Returns the bound port (which may
    /// differ when 0 was requested).
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))
    }

    /// Cancel a peer-side TCP listener.
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))
    }

    /// Ask the owner task to close the SSH connection.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Disconnect).await;
    }

    /// Whether the owner task is still running.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// A live, authenticated SSH session.
///
/// Owns the handle owner task, the shutdown halter, and the per-session
/// reverse-forward registry. Tunnels created from this session subscribe to
/// the halter and stop when it is raised or when the SSH connection dies.
pub struct SessionHandle {
    controller: SessionController,
    halter: broadcast::Sender<()>,
    registry: Arc<ReverseRegistry>,
    idle_timeout: Duration,
    quiet: bool,
    label: String,
}

impl SessionHandle {
    pub(crate) fn new(
        handle: Handle<ClientHandler>,
        label: String,
        registry: Arc<ReverseRegistry>,
        idle_timeout: Duration,
        quiet: bool,
    ) -> Self {
        let (halter, _) = broadcast::channel(1);
        let controller = spawn_session_task(handle, label.clone(), halter.clone());
        Self {
            controller,
            halter,
            registry,
            idle_timeout,
            quiet,
            label,
        }
    }

    pub fn controller(&self) -> SessionController {
        self.controller.clone()
    }

    /// Subscribe to the shutdown halter.
    pub fn subscribe_halt(&self) -> broadcast::Receiver<()> {
        self.halter.subscribe()
    }

    pub(crate) fn registry(&self) -> Arc<ReverseRegistry> {
        self.registry.clone()
    }

    /// Idle timeout applied to this session's tunneled channels (zero when
    /// disabled).
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub(crate) fn quiet(&self) -> bool {
        self.quiet
    }

    /// `sshd_host:port` this session is connected to.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    /// Raise the halter and close the SSH connection. Every tunnel and pump
    /// belonging to this session exits at its next suspension point.
    pub async fn close(&self) {
        let _ = self.halter.send(());
        self.controller.disconnect().await;
    }
}

/// Spawn the owner task: consumes the russh handle and serves commands until
/// disconnected, then raises the halter and drains stragglers.
fn spawn_session_task(
    handle: Handle<ClientHandler>,
    label: String,
    halter: broadcast::Sender<()>,
) -> SessionController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle; // sole owner from here on

        debug!(session = %label, "session owner task started");

        loop {
            match cmd_rx.recv().await {
                Some(SessionCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // channel is dropped, the server will close it
                        warn!(session = %label, "caller dropped before receiving direct-tcpip channel");
                    }
                }

                Some(SessionCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = *bound_port;
                            if reply_tx.send(result).is_err() {
                                // caller disappeared after the forward was
                                // established; cancel the orphan immediately
                                warn!(
                                    session = %label,
                                    %address, bound_port,
                                    "caller dropped after tcpip-forward succeeded, cancelling orphan"
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                Some(SessionCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                Some(SessionCommand::Disconnect) => {
                    info!(session = %label, "disconnect requested");
                    break;
                }

                None => {
                    debug!(session = %label, "all controllers dropped");
                    break;
                }
            }
        }

        // raise the halter so tunnels and pumps stop, then refuse whatever
        // is still queued
        let _ = halter.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await;
        debug!(session = %label, "session owner task terminated");
    });

    SessionController::new(cmd_tx)
}

/// Fail every queued command with a disconnect.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<SessionCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            SessionCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            SessionCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            SessionCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            SessionCommand::Disconnect => {}
        }
    }
}
