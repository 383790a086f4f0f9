use crate::{CacheStore, StorageError};
use chatlog_core::{real_messages, TimelineEntry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Earliest and latest real-message timestamps of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBounds {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl CacheBounds {
    pub fn of(entries: &[TimelineEntry]) -> Option<Self> {
        real_messages(entries).fold(None, |bounds: Option<CacheBounds>, message| {
            let ts = message.timestamp;
            Some(match bounds {
                Some(b) => CacheBounds {
                    earliest: b.earliest.min(ts),
                    latest: b.latest.max(ts),
                },
                None => CacheBounds {
                    earliest: ts,
                    latest: ts,
                },
            })
        })
    }
}

/// Outcome of [`MessageCache::commit_with`].
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// Entry as it was before the commit, `None` if never cached.
    pub previous: Option<Vec<TimelineEntry>>,
    pub entries: Vec<TimelineEntry>,
}

/// Accessor over a [`CacheStore`]. Every write replaces the whole entry.
#[derive(Clone)]
pub struct MessageCache {
    store: Arc<dyn CacheStore>,
    conversation_locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl MessageCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            conversation_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Vec<TimelineEntry>>, StorageError> {
        self.store.get(conversation_id).await
    }

    pub async fn set(&self, conversation_id: &str, entries: &[TimelineEntry]) -> bool {
        self.store.set(conversation_id, entries).await
    }

    pub async fn has_entry(&self, conversation_id: &str) -> Result<bool, StorageError> {
        Ok(self.get(conversation_id).await?.is_some())
    }

    pub async fn bounds(&self, conversation_id: &str) -> Result<Option<CacheBounds>, StorageError> {
        Ok(self
            .get(conversation_id)
            .await?
            .and_then(|entries| CacheBounds::of(&entries)))
    }

    pub async fn frontier(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.store.frontier(conversation_id).await
    }

    pub async fn cached_conversations(&self) -> Result<Vec<String>, StorageError> {
        self.store.conversation_ids().await
    }

    pub async fn remove(&self, conversation_id: &str) -> Result<(), StorageError> {
        let _permit = self.acquire_conversation_permit(conversation_id).await;
        self.store.remove(conversation_id).await
    }

    /// Reads the current entry, computes the replacement with `build` and
    /// writes it, all while holding the conversation's lock.
    pub async fn commit_with<F>(
        &self,
        conversation_id: &str,
        build: F,
    ) -> Result<CommitResult, StorageError>
    where
        F: FnOnce(Option<&[TimelineEntry]>) -> Vec<TimelineEntry> + Send,
    {
        let _permit = self.acquire_conversation_permit(conversation_id).await;

        let previous = self.store.get(conversation_id).await?;
        let entries = build(previous.as_deref());
        if !self.store.set(conversation_id, &entries).await {
            return Err(StorageError::Rejected {
                conversation_id: conversation_id.to_string(),
            });
        }

        tracing::debug!(
            conversation = %conversation_id,
            entries = entries.len(),
            "cache entry committed"
        );
        Ok(CommitResult { previous, entries })
    }

    async fn acquire_conversation_permit(
        &self,
        conversation_id: &str,
    ) -> Option<OwnedSemaphorePermit> {
        let sem = {
            let mut map = self.conversation_locks.lock().await;
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        sem.acquire_owned().await.ok()
    }
}
