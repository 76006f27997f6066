//! Host-key acceptance policy
//!
//! Classifies the key a server presented during key exchange against the
//! trust store. The classification is consumed once per handshake; any state
//! other than [`HostState::KnownOK`] must fail the handshake.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::store::{ServerPubKeyRecord, StoreError, TrustStore};

/// Advisory returned when the add-if-not-known flag was set for an already
/// known server.
pub const REDUNDANT_NEW_FLAG_MSG: &str =
    "error: flag -new given but not needed; re-run without -new";

/// Outcome of classifying a presented server key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// No stored record matches and adding was not requested.
    Unknown,
    /// The key is recorded as banned; always vetoes, regardless of flags.
    Banned,
    /// The key matches a record we previously allowed.
    KnownOK,
    /// The key is on record but the hostname witness differs (possible
    /// man-in-the-middle).
    KnownRecordMismatch,
    /// First contact: the record was added and synced, and the operator must
    /// confirm by reconnecting without the add flag.
    AddedNew,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Unknown => "Unknown",
            HostState::Banned => "Banned",
            HostState::KnownOK => "KnownOK",
            HostState::KnownRecordMismatch => "KnownRecordMismatch",
            HostState::AddedNew => "AddedNew",
        };
        f.write_str(s)
    }
}

/// Result of [`HostKeyPolicy::classify`]: the terminal state, the record it
/// was decided against (if any), and an operator-facing message when the
/// decision warrants one.
#[derive(Debug, Clone)]
pub struct Classification {
    pub state: HostState,
    pub record: Option<ServerPubKeyRecord>,
    pub message: Option<String>,
}

/// Decision engine over the trust store.
///
/// The in-memory decision never blocks on I/O; only the first-contact insert
/// suspends while the store syncs.
pub struct HostKeyPolicy {
    store: Arc<TrustStore>,
    add_if_not_known: bool,
    allow_oneshot_connect: bool,
}

impl HostKeyPolicy {
    pub fn new(store: Arc<TrustStore>, add_if_not_known: bool, allow_oneshot_connect: bool) -> Self {
        Self {
            store,
            add_if_not_known,
            allow_oneshot_connect,
        }
    }

    /// Classify a presented key. Performs at most one durable upsert (the
    /// first-contact insert). Deterministic for a given store state and
    /// inputs.
    pub async fn classify(
        &self,
        hostname: &str,
        remote_addr: &str,
        human_key: &str,
    ) -> Result<Classification, StoreError> {
        if let Some(record) = self.store.lookup(human_key) {
            if record.banned {
                let message = format!(
                    "the key '{}' has been marked as banned",
                    human_key.trim_end()
                );
                return Ok(Classification {
                    state: HostState::Banned,
                    record: Some(record),
                    message: Some(message),
                });
            }

            // no hostname witness check for loopback contacts
            if hostname.starts_with("localhost") || hostname.starts_with("127.0.0.1") {
                return Ok(Classification {
                    state: HostState::KnownOK,
                    record: Some(record),
                    message: self.redundant_flag_advisory(),
                });
            }

            if record.hostname != hostname {
                let message = format!(
                    "hostname mismatch for key '{}': '{}' on record, '{}' supplied now",
                    human_key.trim_end(),
                    record.hostname,
                    hostname
                );
                return Ok(Classification {
                    state: HostState::KnownRecordMismatch,
                    record: Some(record),
                    message: Some(message),
                });
            }

            return Ok(Classification {
                state: HostState::KnownOK,
                record: Some(record),
                message: self.redundant_flag_advisory(),
            });
        }

        if self.add_if_not_known {
            let record = ServerPubKeyRecord {
                hostname: hostname.to_string(),
                remote_addr: remote_addr.to_string(),
                human_key: human_key.to_string(),
                banned: false,
            };
            self.store.upsert(record.clone()).await?;
            debug!(%hostname, %remote_addr, "recorded previously unknown sshd host key");

            if self.allow_oneshot_connect {
                return Ok(Classification {
                    state: HostState::KnownOK,
                    record: Some(record),
                    message: None,
                });
            }

            let message = format!(
                "good: add previously unknown sshd host '{}' with the -new flag. \
                 Re-run without -new now",
                remote_addr
            );
            return Ok(Classification {
                state: HostState::AddedNew,
                record: Some(record),
                message: Some(message),
            });
        }

        Ok(Classification {
            state: HostState::Unknown,
            record: None,
            message: None,
        })
    }

    fn redundant_flag_advisory(&self) -> Option<String> {
        self.add_if_not_known
            .then(|| REDUNDANT_NEW_FLAG_MSG.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeKeyForPolicyTests";

    async fn empty_store(dir: &tempfile::TempDir) -> Arc<TrustStore> {
        Arc::new(
            TrustStore::open(dir.path().join("known-sshd.json"))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_first_contact_then_confirmed() {
        let dir = tempdir().unwrap();
        let store = empty_store(&dir).await;

        // First contact with the add flag: record lands, but the operator
        // must reconnect to confirm.
        let policy = HostKeyPolicy::new(store.clone(), true, false);
        let c = policy
            .classify("sshd.example", "10.0.0.5:22", KEY)
            .await
            .unwrap();
        assert_eq!(c.state, HostState::AddedNew);
        assert!(c.message.unwrap().contains("good: add previously unknown sshd host"));
        assert_eq!(store.len(), 1);

        // Re-run without the flag: known and accepted.
        let policy = HostKeyPolicy::new(store.clone(), false, false);
        let c = policy
            .classify("sshd.example", "10.0.0.5:22", KEY)
            .await
            .unwrap();
        assert_eq!(c.state, HostState::KnownOK);
        assert!(c.message.is_none());
    }

    #[tokio::test]
    async fn test_oneshot_first_contact_proceeds() {
        let dir = tempdir().unwrap();
        let store = empty_store(&dir).await;

        let policy = HostKeyPolicy::new(store.clone(), true, true);
        let c = policy
            .classify("sshd.example", "10.0.0.5:22", KEY)
            .await
            .unwrap();
        assert_eq!(c.state, HostState::KnownOK);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_hostname_mismatch_and_localhost_bypass() {
        let dir = tempdir().unwrap();
        let store = empty_store(&dir).await;
        store
            .upsert(ServerPubKeyRecord {
                hostname: "a.example".into(),
                remote_addr: "10.0.0.5:22".into(),
                human_key: KEY.into(),
                banned: false,
            })
            .await
            .unwrap();

        let policy = HostKeyPolicy::new(store.clone(), false, false);

        let c = policy
            .classify("b.example", "10.0.0.6:22", KEY)
            .await
            .unwrap();
        assert_eq!(c.state, HostState::KnownRecordMismatch);
        assert!(c.message.unwrap().contains("hostname mismatch"));

        // Same key from a loopback hostname skips the witness check.
        let c = policy
            .classify("localhost:2222", "127.0.0.1:2222", KEY)
            .await
            .unwrap();
        assert_eq!(c.state, HostState::KnownOK);
    }

    #[tokio::test]
    async fn test_banned_vetoes_regardless_of_flags() {
        let dir = tempdir().unwrap();
        let store = empty_store(&dir).await;
        store
            .upsert(ServerPubKeyRecord {
                hostname: "sshd.example".into(),
                remote_addr: "10.0.0.5:22".into(),
                human_key: KEY.into(),
                banned: true,
            })
            .await
            .unwrap();

        for (add, oneshot) in [(false, false), (true, false), (true, true)] {
            let policy = HostKeyPolicy::new(store.clone(), add, oneshot);
            let c = policy
                .classify("sshd.example", "10.0.0.5:22", KEY)
                .await
                .unwrap();
            assert_eq!(c.state, HostState::Banned);
            assert!(c.message.unwrap().contains("banned"));
        }
    }

    #[tokio::test]
    async fn test_redundant_add_flag_advisory() {
        let dir = tempdir().unwrap();
        let store = empty_store(&dir).await;
        store
            .upsert(ServerPubKeyRecord {
                hostname: "sshd.example".into(),
                remote_addr: "10.0.0.5:22".into(),
                human_key: KEY.into(),
                banned: false,
            })
            .await
            .unwrap();

        let policy = HostKeyPolicy::new(store.clone(), true, false);
        let c = policy
            .classify("sshd.example", "10.0.0.5:22", KEY)
            .await
            .unwrap();
        assert_eq!(c.state, HostState::KnownOK);
        assert_eq!(c.message.as_deref(), Some(REDUNDANT_NEW_FLAG_MSG));
    }

    #[tokio::test]
    async fn test_unknown_without_flag() {
        let dir = tempdir().unwrap();
        let store = empty_store(&dir).await;

        let policy = HostKeyPolicy::new(store.clone(), false, false);
        let c = policy
            .classify("sshd.example", "10.0.0.5:22", KEY)
            .await
            .unwrap();
        assert_eq!(c.state, HostState::Unknown);
        assert!(c.record.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_classification_is_deterministic() {
        let dir = tempdir().unwrap();
        let store = empty_store(&dir).await;
        let policy = HostKeyPolicy::new(store, false, false);

        let a = policy
            .classify("sshd.example", "10.0.0.5:22", KEY)
            .await
            .unwrap();
        let b = policy
            .classify("sshd.example", "10.0.0.5:22", KEY)
            .await
            .unwrap();
        assert_eq!(a.state, b.state);
        assert_eq!(a.record, b.record);
    }
}
