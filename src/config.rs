//! Tunnel configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::trust::StoreFormat;

/// Configuration for one SSH tunnel session.
///
/// Carries the endpoint, the authentication inputs (any subset of private
/// key, passphrase, and TOTP URL), the host-key policy flags, and the
/// module-level toggles that the tunnels inherit. There are no process-global
/// settings; everything flows through this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Remote sshd host address
    pub host: String,

    /// Remote sshd port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Path to a private key file. `None` disables public-key auth; a path
    /// that fails to load is a hard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,

    /// Login passphrase. Enables password auth and answers the
    /// keyboard-interactive password challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// `otpauth://totp/...` URL. Enables keyboard-interactive auth with
    /// google-authenticator challenge/response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_url: Option<String>,

    /// Accept a previously unknown server key and record it (the operator's
    /// `-new` flag).
    #[serde(default)]
    pub add_if_not_known: bool,

    /// With `add_if_not_known`, proceed on the same connection instead of
    /// requiring a confirming re-run.
    #[serde(default)]
    pub allow_oneshot_connect: bool,

    /// TCP dial + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout applied to tunneled SSH channels, in milliseconds.
    /// 0 disables the timeout.
    #[serde(default)]
    pub idle_timeout_ms: u64,

    /// Suppress per-connection info logging (accept/dial chatter drops to
    /// debug level).
    #[serde(default)]
    pub quiet: bool,

    /// On-disk encoding of the trust store
    #[serde(default)]
    pub store_format: StoreFormat,
}

impl TunnelConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// `host:port` as dialed
    pub fn hostport(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            key_path: None,
            passphrase: None,
            totp_url: None,
            add_if_not_known: false,
            allow_oneshot_connect: false,
            connect_timeout_secs: 30,
            idle_timeout_ms: 0,
            quiet: false,
            store_format: StoreFormat::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let cfg: TunnelConfig =
            serde_json::from_str(r#"{"host": "sshd.example", "username": "alice"}"#).unwrap();
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.idle_timeout(), Duration::ZERO);
        assert!(!cfg.add_if_not_known);
        assert!(!cfg.quiet);
        assert_eq!(cfg.hostport(), "sshd.example:22");
    }

    #[test]
    fn test_idle_timeout_conversion() {
        let mut cfg = TunnelConfig::new("h", "u");
        cfg.idle_timeout_ms = 250;
        assert_eq!(cfg.idle_timeout(), Duration::from_millis(250));
    }
}
