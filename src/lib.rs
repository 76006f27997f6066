//! sshovel - SSH tunneling library
//!
//! Establishes authenticated SSH client sessions and multiplexes TCP
//! streams over them in both directions.
//!
//! # Features
//! - Persisted host-key trust store with a ban list and a first-contact
//!   confirmation flow ([`trust`])
//! - Auth orchestration: public key, password, and keyboard-interactive with
//!   TOTP challenge/response ([`auth`])
//! - Forward tunnels (local listener -> remote endpoint via the sshd) and
//!   reverse tunnels (remote listener -> local endpoint) ([`tunnel`])
//! - Per-channel idle timeouts that auto-extend on activity and are
//!   distinguishable from EOF ([`tunnel::idle`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshovel::{ForwardSpec, SshConnector, TrustStore, TunnelConfig};
//!
//! # async fn demo() -> Result<(), sshovel::TunnelError> {
//! let store = Arc::new(TrustStore::open("known-sshd.json").await?);
//! let mut config = TunnelConfig::new("sshd.example", "alice");
//! config.passphrase = Some("secret".into());
//!
//! let connector = SshConnector::new(config, store);
//! let session = connector.connect().await?;
//!
//! let tunnel = sshovel::start_forward(
//!     &session,
//!     ForwardSpec::new("127.0.0.1:8888", "internal.example", 80),
//! )
//! .await?;
//! # let _ = tunnel;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod trust;
pub mod tunnel;

pub use client::SshConnector;
pub use config::TunnelConfig;
pub use error::TunnelError;
pub use session::{SessionController, SessionHandle};
pub use trust::{
    authorized_key_line, fingerprint, Classification, HostKeyPolicy, HostState,
    ServerPubKeyRecord, StoreError, StoreFormat, TrustStore,
};
pub use tunnel::forward::{start_forward, ForwardSpec, ForwardTunnel};
pub use tunnel::idle::{IdleStream, IdleTimer, IsTimeout};
pub use tunnel::reverse::{start_reverse, ReverseSpec, ReverseTunnel};
pub use tunnel::shovel::ShovelPair;
pub use tunnel::{StatsSnapshot, TunnelStats};
