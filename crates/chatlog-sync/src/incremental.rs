use chatlog_api::{ApiError, ChatlogQuery, ChatlogSource};
use chatlog_config::RefreshConfig;
use chatlog_core::time::days_between_ceil;
use chatlog_core::{CivilDateRange, CivilZone, Message, TimelineEntry};
use chrono::{DateTime, Duration, Utc};

/// What a background refresh asks the archive for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalPlan {
    pub query: ChatlogQuery,
    /// Only messages at or after this instant are kept.
    pub frontier: Option<DateTime<Utc>>,
    /// Set when the backlog exceeded the incremental window and older days
    /// were left to history loading.
    pub capped: bool,
}

pub fn plan_incremental(
    conversation_id: &str,
    cached: Option<&[TimelineEntry]>,
    resume_hint: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    zone: &CivilZone,
    config: &RefreshConfig,
) -> IncrementalPlan {
    let cached_frontier = cached.and_then(|entries| {
        chatlog_core::real_messages(entries)
            .map(|message| message.timestamp)
            .max()
    });

    let Some(frontier) = resume_hint.or(cached_frontier) else {
        return IncrementalPlan {
            query: ChatlogQuery::new(
                conversation_id,
                CivilDateRange::single(zone.date_of(now)),
                config.page_size,
            ),
            frontier: None,
            capped: false,
        };
    };

    let backlog_days = days_between_ceil(frontier, now);
    let capped = backlog_days > config.incremental_max_days;
    let range = if capped {
        CivilDateRange::covering(zone, now - Duration::days(config.incremental_max_days), now)
    } else {
        CivilDateRange::covering(zone, frontier.min(now), now)
    };

    IncrementalPlan {
        query: ChatlogQuery::new(conversation_id, range, config.fetch_limit()),
        frontier: Some(frontier),
        capped,
    }
}

/// Runs `plan` and drops everything older than its frontier.
pub async fn fetch_incremental(
    source: &dyn ChatlogSource,
    plan: &IncrementalPlan,
) -> Result<Vec<Message>, ApiError> {
    let fetched = source.fetch_messages(&plan.query).await?;
    let total = fetched.len();
    let kept: Vec<Message> = match plan.frontier {
        Some(frontier) => fetched
            .into_iter()
            .filter(|message| message.timestamp >= frontier)
            .collect(),
        None => fetched,
    };

    tracing::debug!(
        conversation = %plan.query.conversation_id,
        range = %plan.query.range,
        capped = plan.capped,
        fetched = total,
        kept = kept.len(),
        "incremental fetch finished"
    );
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlog_core::MessageKind;
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn cached_at(ts: DateTime<Utc>) -> Vec<TimelineEntry> {
        vec![TimelineEntry::Message(chatlog_core::Message {
            conversation_id: "alice".to_string(),
            seq: 1,
            timestamp: ts,
            sender_id: "alice".to_string(),
            sender_name: None,
            is_outgoing: false,
            kind: MessageKind::Text,
            sub_kind: 0,
            content: "hi".to_string(),
            contents: None,
        })]
    }

    #[test]
    fn uncached_conversation_fetches_today() {
        let zone = CivilZone::default();
        let config = RefreshConfig::default();
        // 2024-01-09T20:00Z is 2024-01-10 in the civil zone.
        let plan = plan_incremental("alice", None, None, at(2024, 1, 9, 20), &zone, &config);
        assert_eq!(plan.query.range, CivilDateRange::single(date(2024, 1, 10)));
        assert_eq!(plan.query.limit, config.page_size);
        assert!(plan.frontier.is_none());
    }

    #[test]
    fn short_backlog_fetches_exact_range() {
        let zone = CivilZone::default();
        let config = RefreshConfig::default();
        let cached = cached_at(at(2024, 1, 7, 0));
        let now = at(2024, 1, 10, 0);
        let plan = plan_incremental("alice", Some(&cached), None, now, &zone, &config);
        assert_eq!(plan.query.range, CivilDateRange::new(date(2024, 1, 7), date(2024, 1, 10)));
        assert_eq!(plan.query.limit, config.fetch_limit());
        assert_eq!(plan.frontier, Some(at(2024, 1, 7, 0)));
        assert!(!plan.capped);
    }

    #[test]
    fn long_backlog_is_capped_to_recent_days() {
        let zone = CivilZone::default();
        let config = RefreshConfig::default();
        let cached = cached_at(at(2023, 12, 1, 0));
        let now = at(2024, 1, 10, 0);
        let plan = plan_incremental("alice", Some(&cached), None, now, &zone, &config);
        assert!(plan.capped);
        assert_eq!(plan.query.range, CivilDateRange::new(date(2024, 1, 3), date(2024, 1, 10)));
    }

    #[test]
    fn resume_hint_overrides_cached_frontier() {
        let zone = CivilZone::default();
        let config = RefreshConfig::default();
        let cached = cached_at(at(2024, 1, 1, 0));
        let plan = plan_incremental(
            "alice",
            Some(&cached),
            Some(at(2024, 1, 9, 0)),
            at(2024, 1, 10, 0),
            &zone,
            &config,
        );
        assert_eq!(plan.frontier, Some(at(2024, 1, 9, 0)));
        assert_eq!(plan.query.range, CivilDateRange::new(date(2024, 1, 9), date(2024, 1, 10)));
    }
}
