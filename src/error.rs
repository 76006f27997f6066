//! Tunnel error types

use thiserror::Error;

use crate::trust::StoreError;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Host-key policy rejected the handshake. The message carries the
    /// operator-visible diagnostic (banned server, record mismatch, unknown
    /// server, or first-contact confirmation).
    #[error("host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("key error: {0}")]
    KeyError(String),

    #[error("trust store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("disconnected")]
    Disconnected,
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(err: russh::keys::Error) -> Self {
        TunnelError::KeyError(err.to_string())
    }
}
