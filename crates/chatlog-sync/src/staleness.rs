use crate::SyncError;
use chatlog_core::ConversationSummary;
use chatlog_storage::MessageCache;
use chrono::Duration;

/// Conversations whose remote last activity is newer than the cached
/// frontier by more than `tolerance`.
///
/// Conversations without a cache entry, or without a timestamp on either
/// side, are skipped.
pub async fn detect_stale(
    cache: &MessageCache,
    conversations: &[ConversationSummary],
    tolerance: Duration,
) -> Result<Vec<String>, SyncError> {
    let mut stale = Vec::new();
    let mut checked = 0usize;

    for conversation in conversations {
        let Some(remote) = conversation.last_activity else {
            continue;
        };
        let Some(frontier) = cache.frontier(&conversation.id).await? else {
            continue;
        };
        checked += 1;

        if remote - frontier > tolerance {
            tracing::debug!(
                conversation = %conversation.id,
                lag_ms = (remote - frontier).num_milliseconds(),
                "conversation needs refresh"
            );
            stale.push(conversation.id.clone());
        }
    }

    tracing::info!(
        total = conversations.len(),
        checked,
        stale = stale.len(),
        "staleness check finished"
    );
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::message;
    use chatlog_core::{ConversationKind, TimelineEntry};
    use chatlog_storage::MemoryCacheStore;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn summary(id: &str, last_activity: Option<DateTime<Utc>>) -> ConversationSummary {
        ConversationSummary {
            id: id.to_string(),
            display_name: id.to_string(),
            kind: ConversationKind::Private,
            last_activity,
            last_message_preview: None,
        }
    }

    #[tokio::test]
    async fn flags_only_cached_conversations_beyond_tolerance() {
        let cache = MessageCache::new(Arc::new(MemoryCacheStore::new()));
        let frontier = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        for id in ["behind", "jitter", "current"] {
            assert!(cache.set(id, &[TimelineEntry::Message(message(id, 1, frontier))]).await);
        }

        let conversations = vec![
            summary("behind", Some(frontier + Duration::minutes(5))),
            summary("jitter", Some(frontier + Duration::milliseconds(800))),
            summary("current", Some(frontier)),
            summary("uncached", Some(frontier + Duration::days(1))),
            summary("no-time", None),
        ];

        let stale = detect_stale(&cache, &conversations, Duration::milliseconds(1000))
            .await
            .expect("detection ran");
        assert_eq!(stale, vec!["behind"]);
    }

    #[tokio::test]
    async fn gap_only_entries_are_skipped() {
        let cache = MessageCache::new(Arc::new(MemoryCacheStore::new()));
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let gap = chatlog_core::GapSentinel::new(
            "quiet",
            chatlog_core::TimeWindow::new(now - Duration::days(3), now),
            None,
            3,
        );
        assert!(cache.set("quiet", &[TimelineEntry::Gap(gap)]).await);

        let stale = detect_stale(&cache, &[summary("quiet", Some(now))], Duration::seconds(1))
            .await
            .expect("detection ran");
        assert!(stale.is_empty());
    }
}
