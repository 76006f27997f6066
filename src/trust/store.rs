//! Persistent trust store for accepted sshd host keys
//!
//! Records are indexed by the exact authorized-key text of the server's
//! public key. Every mutation is durable before the caller observes success.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Trust store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to determine trust store directory")]
    NoStoreDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk encoding of the trust store, named by filename extension suffix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFormat {
    #[default]
    Json,
}

impl StoreFormat {
    /// Extension suffix identifying this encoding on disk
    pub fn extension(&self) -> &'static str {
        match self {
            StoreFormat::Json => ".json",
        }
    }
}

/// One accepted (or banned) server key.
///
/// `hostname` and `remote_addr` are the last-seen witnesses consulted by the
/// policy; the store key is `human_key` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPubKeyRecord {
    /// Hostname last seen presenting this key
    pub hostname: String,
    /// Remote socket address last seen, in text form
    pub remote_addr: String,
    /// Authorized-key one-line text of the server public key
    pub human_key: String,
    /// Banned keys are retained forever and always veto the handshake
    #[serde(default)]
    pub banned: bool,
}

/// Durable mapping from server-key text to [`ServerPubKeyRecord`].
///
/// A `lookup` after a completed `upsert` returns the new record; writers are
/// serialized, and the file is replaced atomically (temp file + `sync_all` +
/// rename) so a crash never leaves a torn store.
pub struct TrustStore {
    hosts: RwLock<HashMap<String, ServerPubKeyRecord>>,
    path: PathBuf,
    /// Serializes snapshot writes to the backing file
    io_lock: tokio::sync::Mutex<()>,
}

impl TrustStore {
    /// Open a store at `path`, loading any existing records. A missing file
    /// is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let hosts = match fs::read_to_string(&path).await {
            Ok(contents) => {
                let records: Vec<ServerPubKeyRecord> = serde_json::from_str(&contents)?;
                records
                    .into_iter()
                    .map(|r| (r.human_key.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(
            entries = hosts.len(),
            path = %path.display(),
            "loaded trust store"
        );

        Ok(Self {
            hosts: RwLock::new(hosts),
            path,
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Default store location: `~/.sshovel/known-sshd` plus the format's
    /// extension suffix.
    pub fn default_path(format: StoreFormat) -> Result<PathBuf, StoreError> {
        dirs::home_dir()
            .map(|home| {
                home.join(".sshovel")
                    .join(format!("known-sshd{}", format.extension()))
            })
            .ok_or(StoreError::NoStoreDir)
    }

    /// Look up the record for an authorized-key line.
    pub fn lookup(&self, human_key: &str) -> Option<ServerPubKeyRecord> {
        self.hosts.read().get(human_key).cloned()
    }

    /// Insert or replace the record for its key, then force durability.
    /// Does not return until the change would survive a crash.
    pub async fn upsert(&self, record: ServerPubKeyRecord) -> Result<(), StoreError> {
        {
            let mut hosts = self.hosts.write();
            hosts.insert(record.human_key.clone(), record);
        }
        self.sync().await
    }

    /// Write the current contents to disk and fsync.
    pub async fn sync(&self) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;

        // snapshot under the writer lock so concurrent syncs hit the file in
        // snapshot order and a later map state never loses to an earlier one
        let json = {
            let hosts = self.hosts.read();
            let mut records: Vec<&ServerPubKeyRecord> = hosts.values().collect();
            records.sort_by(|a, b| a.human_key.cmp(&b.human_key));
            serde_json::to_string_pretty(&records)?
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(key: &str, hostname: &str) -> ServerPubKeyRecord {
        ServerPubKeyRecord {
            hostname: hostname.to_string(),
            remote_addr: "10.0.0.5:22".to_string(),
            human_key: key.to_string(),
            banned: false,
        }
    }

    #[tokio::test]
    async fn test_round_trip_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known-sshd.json");

        let rec = record("ssh-ed25519 AAAAC3Nz...test", "sshd.example");
        {
            let store = TrustStore::open(&path).await.unwrap();
            store.upsert(rec.clone()).await.unwrap();
            store.sync().await.unwrap();
        }

        let reopened = TrustStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.lookup(&rec.human_key), Some(rec));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(store.is_empty());
        assert_eq!(store.lookup("anything"), None);
    }

    #[tokio::test]
    async fn test_upsert_replaces_record_for_same_key() {
        let dir = tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("s.json")).await.unwrap();

        store
            .upsert(record("ssh-rsa AAAA...k1", "old.example"))
            .await
            .unwrap();
        store
            .upsert(record("ssh-rsa AAAA...k1", "new.example"))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let rec = store.lookup("ssh-rsa AAAA...k1").unwrap();
        assert_eq!(rec.hostname, "new.example");
    }

    #[tokio::test]
    async fn test_banned_record_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.json");

        {
            let store = TrustStore::open(&path).await.unwrap();
            let mut rec = record("ssh-rsa AAAA...banned", "evil.example");
            rec.banned = true;
            store.upsert(rec).await.unwrap();
        }

        let store = TrustStore::open(&path).await.unwrap();
        assert!(store.lookup("ssh-rsa AAAA...banned").unwrap().banned);
    }

    #[test]
    fn test_format_extension() {
        assert_eq!(StoreFormat::Json.extension(), ".json");
        assert_eq!(StoreFormat::default(), StoreFormat::Json);
    }

    #[tokio::test]
    async fn test_lookup_sees_completed_upsert() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(
            TrustStore::open(dir.path().join("s.json")).await.unwrap(),
        );

        let rec = record("ssh-ed25519 AAAA...concurrent", "host.example");
        store.upsert(rec.clone()).await.unwrap();

        let store2 = store.clone();
        let seen = tokio::task::spawn_blocking(move || store2.lookup(&rec.human_key))
            .await
            .unwrap();
        assert!(seen.is_some());
    }
}
