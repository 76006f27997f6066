//! SSH session establishment
//!
//! Dials the sshd, runs the handshake with the host-key policy wired into
//! the russh callback, drives the auth method list, and hands back a live
//! [`SessionHandle`]. The last host-key classification stays readable from
//! the connector after the handshake completes or fails.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tracing::{debug, info, warn};

use crate::auth::{self, build_auth_methods};
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::session::SessionHandle;
use crate::trust::{
    authorized_key_line, fingerprint, Classification, HostKeyPolicy, HostState, TrustStore,
};
use crate::tunnel::reverse::{self, ReverseRegistry};

/// Establishes authenticated sessions against one sshd endpoint.
pub struct SshConnector {
    config: TunnelConfig,
    store: Arc<TrustStore>,
    witness: Arc<Mutex<Option<Classification>>>,
}

impl SshConnector {
    pub fn new(config: TunnelConfig, store: Arc<TrustStore>) -> Self {
        Self {
            config,
            store,
            witness: Arc::new(Mutex::new(None)),
        }
    }

    /// The classification recorded by the most recent handshake attempt,
    /// whether it succeeded or failed.
    pub fn last_classification(&self) -> Option<Classification> {
        self.witness.lock().clone()
    }

    /// Dial, verify the host key against the trust store, authenticate, and
    /// return a live session. Configuration problems (bad key path, no auth
    /// inputs, unresolvable address) fail before any network activity.
    pub async fn connect(&self) -> Result<SessionHandle, TunnelError> {
        let cfg = &self.config;

        let methods = build_auth_methods(
            cfg.key_path.as_deref(),
            cfg.passphrase.as_deref(),
            cfg.totp_url.as_deref(),
        )?;

        let hostport = cfg.hostport();
        let socket_addr = hostport
            .to_socket_addrs()
            .map_err(|e| TunnelError::Config(format!("could not resolve '{}': {}", hostport, e)))?
            .next()
            .ok_or_else(|| {
                TunnelError::Config(format!("no address found for '{}'", hostport))
            })?;

        info!(sshd = %hostport, user = %cfg.username, "connecting");

        let ssh_config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let registry = Arc::new(ReverseRegistry::new());
        let handler = ClientHandler {
            hostname: cfg.host.clone(),
            remote_addr: socket_addr.to_string(),
            policy: HostKeyPolicy::new(
                self.store.clone(),
                cfg.add_if_not_known,
                cfg.allow_oneshot_connect,
            ),
            witness: self.witness.clone(),
            registry: registry.clone(),
            idle_timeout: cfg.idle_timeout(),
            quiet: cfg.quiet,
        };

        // policy rejections surface from inside the handshake with their
        // distinct error, never flattened into a generic dial failure
        let mut handle = tokio::time::timeout(
            cfg.connect_timeout(),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| TunnelError::Timeout(format!("connection to {} timed out", hostport)))??;

        debug!(sshd = %hostport, "handshake complete");

        auth::authenticate(&mut handle, &cfg.username, &methods).await?;

        Ok(SessionHandle::new(
            handle,
            hostport,
            registry,
            cfg.idle_timeout(),
            cfg.quiet,
        ))
    }
}

/// russh callback handler: host-key verification and reverse-forward
/// channel dispatch.
pub struct ClientHandler {
    hostname: String,
    remote_addr: String,
    policy: HostKeyPolicy,
    witness: Arc<Mutex<Option<Classification>>>,
    registry: Arc<ReverseRegistry>,
    idle_timeout: Duration,
    quiet: bool,
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let human_key = authorized_key_line(server_public_key);
        let classification = self
            .policy
            .classify(&self.hostname, &self.remote_addr, &human_key)
            .await?;

        debug!(
            state = %classification.state,
            host = %self.hostname,
            remote = %self.remote_addr,
            fingerprint = %fingerprint(server_public_key),
            "host key classified"
        );

        let state = classification.state;
        let message = classification.message.clone();
        *self.witness.lock() = Some(classification);

        match state {
            HostState::KnownOK => {
                // the add flag on an already known host is only advisory
                if let Some(msg) = message {
                    warn!("{}", msg);
                }
                Ok(true)
            }
            HostState::Banned => Err(TunnelError::HostKeyRejected(format!(
                "banned server: {}",
                message.unwrap_or_default()
            ))),
            HostState::KnownRecordMismatch => Err(TunnelError::HostKeyRejected(format!(
                "known record mismatch: {}",
                message.unwrap_or_default()
            ))),
            HostState::AddedNew => Err(TunnelError::HostKeyRejected(message.unwrap_or_else(
                || "first contact recorded; re-run to confirm".to_string(),
            ))),
            HostState::Unknown => Err(TunnelError::HostKeyRejected(format!(
                "unknown server; could be Man-In-The-Middle attack. If this is \
                 first-time setup, re-run with -new to allow the new host \
                 ({} at {})",
                self.hostname, self.remote_addr
            ))),
        }
    }

    /// The sshd opened a channel for one of our remote listeners: deliver it
    /// to the registered local target. Runs on the SSH event loop, so the
    /// bridging is spawned.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(target) = self.registry.lookup(connected_address, connected_port as u16) else {
            warn!(
                remote = format!("{}:{}", connected_address, connected_port),
                "forwarded channel for an unregistered listener, dropping"
            );
            return Ok(());
        };

        let originator = format!("{}:{}", originator_address, originator_port);
        let idle_timeout = self.idle_timeout;
        let quiet = self.quiet;
        tokio::spawn(async move {
            if let Err(e) =
                reverse::serve_forwarded_channel(channel, target, originator.clone(), idle_timeout, quiet)
                    .await
            {
                // per-connection failure; the listener and session live on
                warn!(%originator, error = %e, "reverse connection failed");
            }
        });

        Ok(())
    }
}
