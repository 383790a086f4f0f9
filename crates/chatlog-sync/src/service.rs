use crate::history::{HistoryFetcher, HistoryPage, HistoryRequest};
use crate::refresh::RefreshContext;
use crate::scheduler::{Priority, RefreshRunSummary, RefreshScheduler, SchedulerReport};
use crate::staleness::detect_stale;
use crate::{CacheEvents, CacheUpdated, Notifier, SyncError};
use chatlog_api::ChatlogSource;
use chatlog_config::{AppConfig, NotificationConfig, RefreshConfig, RefreshConfigPatch};
use chatlog_core::{ConversationSummary, TimelineEntry};
use chatlog_notify::NotificationSink;
use chatlog_storage::{CacheStore, MessageCache};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Priority for refreshes a user is waiting on.
pub const FOREGROUND_PRIORITY: Priority = 10;
/// Priority for staleness-driven background refreshes.
pub const BACKGROUND_PRIORITY: Priority = 0;

/// Entry point wiring the cache, archive client, refresh queue and history
/// loader together. Construct once and share.
#[derive(Clone)]
pub struct SyncService {
    source: Arc<dyn ChatlogSource>,
    cache: MessageCache,
    scheduler: RefreshScheduler,
    history: HistoryFetcher,
    events: CacheEvents,
    notifier: Arc<Notifier>,
}

impl SyncService {
    pub fn new(
        config: &AppConfig,
        source: Arc<dyn ChatlogSource>,
        store: Arc<dyn CacheStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let zone = config.civil_zone()?;
        let cache = MessageCache::new(store);
        let events = CacheEvents::new();
        let notifier = Arc::new(Notifier::new(config.notifications.clone(), sink));

        let scheduler = RefreshScheduler::new(
            RefreshContext {
                source: source.clone(),
                cache: cache.clone(),
                zone,
                events: events.clone(),
                notifier: Some(notifier.clone()),
            },
            config.refresh.clone(),
        );
        let history =
            HistoryFetcher::new(source.clone(), cache.clone(), config.history.clone(), zone);

        Ok(Self {
            source,
            cache,
            scheduler,
            history,
            events,
            notifier,
        })
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdated> {
        self.events.subscribe()
    }

    pub async fn refresh_one(
        &self,
        conversation_id: &str,
        priority: Priority,
        resume_from: Option<DateTime<Utc>>,
    ) -> Result<Option<Vec<TimelineEntry>>, SyncError> {
        self.scheduler.refresh_one(conversation_id, priority, resume_from).await
    }

    pub async fn refresh_batch(
        &self,
        conversation_ids: &[String],
        priority: Priority,
    ) -> RefreshRunSummary {
        self.scheduler.refresh_batch(conversation_ids, priority).await
    }

    pub async fn refresh_all(&self, priority: Priority) -> RefreshRunSummary {
        self.scheduler.refresh_all(priority).await
    }

    /// Loads one page of older history. Failures are returned to the caller,
    /// who may retry with the same request.
    pub async fn load_history(&self, request: &HistoryRequest) -> Result<HistoryPage, SyncError> {
        let (page, committed) = self.history.load(request).await.map_err(|err| {
            tracing::warn!(
                conversation = %request.conversation_id,
                before = %request.before,
                offset = request.offset,
                error = %err,
                "history load failed"
            );
            err
        })?;

        if let Some(entries) = committed {
            self.events.publish(&request.conversation_id, entries);
        }
        Ok(page)
    }

    /// Lists remote conversations and remembers their display names for
    /// notification titles.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
        let conversations = self.source.list_conversations().await?;
        self.notifier.remember_names(&conversations).await;
        Ok(conversations)
    }

    /// Replaces the needs-refresh marks with every conversation whose cache
    /// lags the remote, and returns those ids.
    pub async fn detect_stale(&self) -> Result<Vec<String>, SyncError> {
        let conversations = self.list_conversations().await?;
        let tolerance = Duration::milliseconds(self.scheduler.config().staleness_tolerance_ms);
        let stale = detect_stale(&self.cache, &conversations, tolerance).await?;
        self.scheduler.replace_needs_refresh(stale.iter().cloned());
        Ok(stale)
    }

    /// One pass of the background loop: detect lagging conversations and
    /// refresh the `batch_size` that have waited longest. Does nothing while
    /// disabled.
    pub async fn auto_refresh_tick(&self) -> Result<RefreshRunSummary, SyncError> {
        let config = self.scheduler.config();
        if !config.enabled {
            tracing::debug!("auto refresh disabled, skipping tick");
            return Ok(RefreshRunSummary::default());
        }

        self.detect_stale().await?;
        let batch: Vec<String> = self
            .scheduler
            .needs_refresh()
            .into_iter()
            .take(config.batch_size.max(1))
            .collect();
        if batch.is_empty() {
            return Ok(RefreshRunSummary::default());
        }
        Ok(self.scheduler.refresh_batch(&batch, BACKGROUND_PRIORITY).await)
    }

    pub fn update_refresh_config(
        &self,
        patch: &RefreshConfigPatch,
    ) -> Result<RefreshConfig, SyncError> {
        self.scheduler.update_config(patch)
    }

    pub async fn update_notification_config(&self, config: NotificationConfig) {
        self.notifier.update_config(config).await;
    }

    pub fn report(&self) -> SchedulerReport {
        self.scheduler.report()
    }
}
