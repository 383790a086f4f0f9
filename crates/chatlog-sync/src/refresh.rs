use crate::incremental::{fetch_incremental, plan_incremental};
use crate::merge::merge_messages;
use crate::{CacheEvents, Notifier, SyncError};
use chatlog_api::ChatlogSource;
use chatlog_config::RefreshConfig;
use chatlog_core::{CivilZone, Message, TimelineEntry};
use chatlog_storage::MessageCache;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Everything one refresh attempt touches.
#[derive(Clone)]
pub struct RefreshContext {
    pub source: Arc<dyn ChatlogSource>,
    pub cache: MessageCache,
    pub zone: CivilZone,
    pub events: CacheEvents,
    pub notifier: Option<Arc<Notifier>>,
}

pub(crate) struct AttemptOutput {
    previous: Option<Vec<TimelineEntry>>,
    entries: Vec<TimelineEntry>,
    fetched: Vec<Message>,
}

impl RefreshContext {
    /// Fetch what is new since the frontier and commit the merged entry.
    pub(crate) async fn attempt(
        &self,
        conversation_id: &str,
        resume_hint: Option<DateTime<Utc>>,
        config: &RefreshConfig,
    ) -> Result<AttemptOutput, SyncError> {
        let cached = self.cache.get(conversation_id).await?;
        let plan = plan_incremental(
            conversation_id,
            cached.as_deref(),
            resume_hint,
            Utc::now(),
            &self.zone,
            config,
        );
        let fetched = fetch_incremental(self.source.as_ref(), &plan).await?;

        let max_retained = config.max_retained();
        let commit = self
            .cache
            .commit_with(conversation_id, |previous| {
                merge_messages(previous.unwrap_or_default(), &fetched, Some(max_retained))
            })
            .await?;

        Ok(AttemptOutput {
            previous: commit.previous,
            entries: commit.entries,
            fetched,
        })
    }

    /// Post-commit fan-out: notifications, then the cache-updated event.
    pub(crate) async fn announce(&self, conversation_id: &str, output: AttemptOutput) {
        if let Some(notifier) = &self.notifier {
            let fetched: Vec<TimelineEntry> =
                output.fetched.into_iter().map(TimelineEntry::Message).collect();
            notifier
                .on_fetch(conversation_id, output.previous.as_deref(), &fetched)
                .await;
        }
        self.events.publish(conversation_id, output.entries);
    }
}
