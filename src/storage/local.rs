// src/storage/local.rs

//! Local filesystem storage implementation.
//!
//! Every write goes to a temporary file first and is renamed into place,
//! so a crash never leaves a half-written checkpoint behind. Read-modify-
//! write cycles on the checkpoint file are serialised by an async mutex.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── checkpoint.json
//! └── rules.json
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::storage::{CheckpointStore, ErrorDomain, ErrorRecord, RuleState, RuleStateStore};

const CHECKPOINT_KEY: &str = "checkpoint.json";
const RULES_KEY: &str = "rules.json";

/// On-disk shape of `checkpoint.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointData {
    #[serde(default)]
    last_ids: BTreeMap<String, u64>,
    #[serde(default)]
    resumption_token: Option<String>,
    #[serde(default)]
    errors: BTreeMap<u64, ErrorRecord>,
}

/// Local filesystem storage backend.
#[derive(Clone)]
pub struct LocalStorage {
    root_dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data. A file that exists but does not parse is an error.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                AppError::config(format!("{} is malformed: {e}", self.path(key).display()))
            }),
            None => Ok(None),
        }
    }

    async fn load_checkpoint(&self) -> Result<CheckpointData> {
        Ok(self.read_json(CHECKPOINT_KEY).await?.unwrap_or_default())
    }

    /// Apply a change to the checkpoint file under the store lock.
    async fn update_checkpoint<T: Send>(
        &self,
        change: impl FnOnce(&mut CheckpointData) -> T + Send,
    ) -> Result<T> {
        let _guard = self.lock.lock().await;
        let mut data = self.load_checkpoint().await?;
        let out = change(&mut data);
        self.write_json(CHECKPOINT_KEY, &data).await?;
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for LocalStorage {
    async fn last_id(&self, key: &str) -> Result<Option<u64>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_checkpoint().await?.last_ids.get(key).copied())
    }

    async fn update_last_id(&self, key: &str, id: u64) -> Result<()> {
        let key = key.to_string();
        self.update_checkpoint(move |data| {
            data.last_ids.insert(key, id);
        })
        .await
    }

    async fn resumption_token(&self) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_checkpoint().await?.resumption_token)
    }

    async fn update_resumption_token(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        self.update_checkpoint(move |data| {
            data.resumption_token = Some(token);
        })
        .await
    }

    async fn track_error(&self, warc_id: u64, domain: ErrorDomain) -> Result<ErrorRecord> {
        let now = Utc::now();
        self.update_checkpoint(move |data| {
            let record = data
                .errors
                .entry(warc_id)
                .and_modify(|r| {
                    r.retries += 1;
                    r.last_error = now;
                })
                .or_insert(ErrorRecord {
                    warc_id,
                    last_error: now,
                    retries: 0,
                    domain,
                });
            record.clone()
        })
        .await
    }

    async fn check_error(&self, warc_id: u64) -> Result<Option<ErrorRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_checkpoint().await?.errors.get(&warc_id).cloned())
    }

    async fn remove_error(&self, warc_id: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut data = self.load_checkpoint().await?;
        if data.errors.remove(&warc_id).is_some() {
            self.write_json(CHECKPOINT_KEY, &data).await?;
        }
        Ok(())
    }

    async fn old_errors(&self, domain: ErrorDomain) -> Result<Vec<ErrorRecord>> {
        let _guard = self.lock.lock().await;
        let data = self.load_checkpoint().await?;
        Ok(data
            .errors
            .into_values()
            .rev()
            .filter(|r| r.domain == domain)
            .collect())
    }
}

#[async_trait]
impl RuleStateStore for LocalStorage {
    async fn load_rule_state(&self) -> Result<RuleState> {
        match self.read_json::<RuleState>(RULES_KEY).await? {
            Some(state) => Ok(state),
            None => {
                log::warn!("No {} found, starting without rules", RULES_KEY);
                Ok(RuleState::default())
            }
        }
    }

    async fn save_rule_state(&self, state: &RuleState) -> Result<()> {
        self.write_json(RULES_KEY, state).await
    }
}
