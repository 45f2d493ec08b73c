// src/pipeline/source.rs

//! Where a coordinator gets its WARCs from and how it records progress.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::WarcToIndex;
use crate::services::ArchiveSource;
use crate::storage::{CheckpointStore, ErrorDomain};

/// Batch acquisition and checkpoint strategy of a coordinator.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Name used in logs and status.
    fn name(&self) -> &str;

    fn domain(&self) -> ErrorDomain;

    /// Whether an empty batch ends the run instead of meaning "nothing yet".
    fn finishes_when_exhausted(&self) -> bool;

    /// The next WARCs to index; empty when there is nothing left for now.
    async fn next_batch(&self) -> Result<Vec<WarcToIndex>>;

    /// Record `item` as the last WARC indexed without gaps.
    async fn persist_progress(&self, item: &WarcToIndex) -> Result<()>;
}

/// Only index ids with `id % divisor == remainder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modulo {
    pub divisor: u64,
    pub remainder: u64,
}

impl Modulo {
    pub fn accepts(&self, id: u64) -> bool {
        id % self.divisor == self.remainder
    }
}

/// Walks WARC ids upwards from the last checkpoint.
pub struct RangeBatchSource {
    archive: Arc<dyn ArchiveSource>,
    store: Arc<dyn CheckpointStore>,
    collection_id: u64,
    batch_size: usize,
    modulo: Option<Modulo>,
    retry_delay: Duration,
    key: String,
    /// Highest id listed so far
    cursor: Mutex<Option<u64>>,
    /// Highest id persisted so far
    persisted: Mutex<Option<u64>>,
}

impl RangeBatchSource {
    pub fn new(
        archive: Arc<dyn ArchiveSource>,
        store: Arc<dyn CheckpointStore>,
        collection_id: u64,
        batch_size: usize,
        modulo: Option<Modulo>,
        retry_delay: Duration,
    ) -> Self {
        let key = match modulo {
            Some(m) => format!("full:{}", m.remainder),
            None => "full".to_string(),
        };
        Self {
            archive,
            store,
            collection_id,
            batch_size,
            modulo,
            retry_delay,
            key,
            cursor: Mutex::new(None),
            persisted: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn list_once_retried(&self, start: u64) -> Result<Vec<WarcToIndex>> {
        match self
            .archive
            .list_warcs(self.collection_id, start, self.batch_size)
            .await
        {
            Ok(warcs) => Ok(warcs),
            Err(e) => {
                log::warn!(
                    "Listing WARCs from {} failed, retrying in {:?}: {}",
                    start,
                    self.retry_delay,
                    e
                );
                tokio::time::sleep(self.retry_delay).await;
                self.archive
                    .list_warcs(self.collection_id, start, self.batch_size)
                    .await
            }
        }
    }

    async fn last_seen(&self) -> Result<u64> {
        let cursor = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        match cursor {
            Some(id) => Ok(id),
            None => Ok(self.store.last_id(&self.key).await?.unwrap_or(0)),
        }
    }
}

#[async_trait]
impl BatchSource for RangeBatchSource {
    fn name(&self) -> &str {
        &self.key
    }

    fn domain(&self) -> ErrorDomain {
        ErrorDomain::Full
    }

    fn finishes_when_exhausted(&self) -> bool {
        true
    }

    async fn next_batch(&self) -> Result<Vec<WarcToIndex>> {
        let mut last = self.last_seen().await?;
        loop {
            let listed = self.list_once_retried(last + 1).await?;
            let Some(highest) = listed.iter().map(|w| w.id).max() else {
                return Ok(Vec::new());
            };
            last = last.max(highest);
            *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some(last);

            let batch: Vec<WarcToIndex> = listed
                .into_iter()
                .filter(|w| self.modulo.is_none_or(|m| m.accepts(w.id)))
                .collect();
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    async fn persist_progress(&self, item: &WarcToIndex) -> Result<()> {
        let known = *self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        let known = match known {
            Some(id) => Some(id),
            None => self.store.last_id(&self.key).await?,
        };
        if known.is_some_and(|id| item.id <= id) {
            return Ok(());
        }

        self.store.update_last_id(&self.key, item.id).await?;
        *self.persisted.lock().unwrap_or_else(PoisonError::into_inner) = Some(item.id);
        log::info!("Checkpoint '{}' advanced to WARC {}", self.key, item.id);
        Ok(())
    }
}

/// Follows the archive's sync feed by resumption token.
pub struct TokenBatchSource {
    archive: Arc<dyn ArchiveSource>,
    store: Arc<dyn CheckpointStore>,
    collection_id: u64,
    batch_size: usize,
    last_token: Mutex<Option<String>>,
}

impl TokenBatchSource {
    pub fn new(
        archive: Arc<dyn ArchiveSource>,
        store: Arc<dyn CheckpointStore>,
        collection_id: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            archive,
            store,
            collection_id,
            batch_size,
            last_token: Mutex::new(None),
        }
    }
}

#[async_trait]
impl BatchSource for TokenBatchSource {
    fn name(&self) -> &str {
        "periodic"
    }

    fn domain(&self) -> ErrorDomain {
        ErrorDomain::Periodic
    }

    fn finishes_when_exhausted(&self) -> bool {
        false
    }

    async fn next_batch(&self) -> Result<Vec<WarcToIndex>> {
        let cached = self
            .last_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let after = match cached {
            Some(token) => Some(token),
            None => self.store.resumption_token().await?,
        };

        let batch = self
            .archive
            .sync_warcs(self.collection_id, after.as_deref(), self.batch_size)
            .await?;

        if let Some(token) = batch.iter().rev().find_map(|w| w.resumption_token.clone()) {
            *self.last_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        }
        Ok(batch)
    }

    async fn persist_progress(&self, item: &WarcToIndex) -> Result<()> {
        let Some(token) = &item.resumption_token else {
            return Ok(());
        };
        self.store.update_resumption_token(token).await?;
        log::info!("Resumption token advanced past WARC {}", item.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::storage::LocalStorage;
    use crate::testing::MemoryArchive;

    fn archive_with(ids: &[u64]) -> Arc<MemoryArchive> {
        let archive = Arc::new(MemoryArchive::new());
        for id in ids {
            archive.add_warc(*id, Vec::new());
        }
        archive
    }

    fn ids(batch: &[WarcToIndex]) -> Vec<u64> {
        batch.iter().map(|w| w.id).collect()
    }

    #[tokio::test]
    async fn test_range_source_pages_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::new(dir.path()));
        store.update_last_id("full", 2).await.unwrap();
        let archive = archive_with(&[1, 2, 3, 4, 5, 6]);

        let source = RangeBatchSource::new(archive, store, 1, 2, None, Duration::ZERO);
        assert_eq!(ids(&source.next_batch().await.unwrap()), vec![3, 4]);
        assert_eq!(ids(&source.next_batch().await.unwrap()), vec![5, 6]);
        assert!(source.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_source_modulo() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::new(dir.path()));
        let archive = archive_with(&[1, 2, 3, 4, 5, 6, 7]);
        let modulo = Modulo {
            divisor: 3,
            remainder: 1,
        };

        let source = RangeBatchSource::new(archive, store, 1, 2, Some(modulo), Duration::ZERO);
        assert_eq!(source.key(), "full:1");
        assert_eq!(ids(&source.next_batch().await.unwrap()), vec![1]);
        assert_eq!(ids(&source.next_batch().await.unwrap()), vec![4]);
        assert_eq!(ids(&source.next_batch().await.unwrap()), vec![7]);
        assert!(source.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_source_retries_listing_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::new(dir.path()));
        let archive = archive_with(&[1]);

        archive.fail_listings(1);
        let source = RangeBatchSource::new(
            Arc::clone(&archive) as Arc<dyn ArchiveSource>,
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            1,
            5,
            None,
            Duration::ZERO,
        );
        assert_eq!(ids(&source.next_batch().await.unwrap()), vec![1]);

        archive.fail_listings(2);
        let fresh = RangeBatchSource::new(archive, store, 1, 5, None, Duration::ZERO);
        assert!(fresh.next_batch().await.is_err());
    }

    #[tokio::test]
    async fn test_range_progress_never_regresses() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::new(dir.path()));
        let source = RangeBatchSource::new(
            archive_with(&[]),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            1,
            5,
            None,
            Duration::ZERO,
        );

        source.persist_progress(&WarcToIndex::new(10, 0)).await.unwrap();
        source.persist_progress(&WarcToIndex::new(7, 0)).await.unwrap();
        assert_eq!(store.last_id("full").await.unwrap(), Some(10));
        source.persist_progress(&WarcToIndex::new(12, 0)).await.unwrap();
        assert_eq!(store.last_id("full").await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_token_source_follows_tokens() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::new(dir.path()));
        let archive = archive_with(&[10, 20, 30]);
        let source = TokenBatchSource::new(
            archive,
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            1,
            2,
        );

        let first = source.next_batch().await.unwrap();
        assert_eq!(ids(&first), vec![10, 20]);
        assert_eq!(ids(&source.next_batch().await.unwrap()), vec![30]);
        assert!(source.next_batch().await.unwrap().is_empty());

        source.persist_progress(&first[1]).await.unwrap();
        assert_eq!(
            store.resumption_token().await.unwrap().as_deref(),
            Some("token-20")
        );
    }
}
