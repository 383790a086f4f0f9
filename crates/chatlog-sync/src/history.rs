//! Backward history loading with an adaptive, widening time window.
//!
//! Pages are cut from the newer end of a window: the first page is the most
//! recent `page_size` messages before the anchor, and each continuation
//! moves further back in time.

use crate::merge::{dedup_sorted, merge_timeline};
use crate::SyncError;
use chatlog_api::{ChatlogQuery, ChatlogSource};
use chatlog_config::HistoryConfig;
use chatlog_core::{real_messages, CivilZone, GapSentinel, Message, TimeWindow, TimelineEntry};
use chatlog_storage::MessageCache;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MILLIS_PER_DAY: f64 = 86_400_000.0;
/// Upper bound on archive pages read while draining one window.
const MAX_WINDOW_READS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub conversation_id: String,
    /// Only messages strictly older than this are returned.
    pub before: DateTime<Utc>,
    /// Messages of the window already returned, counted from its newer end.
    pub offset: usize,
    /// Window of a previous page to keep paging through.
    pub continuation: Option<TimeWindow>,
}

impl HistoryRequest {
    pub fn new(conversation_id: impl Into<String>, before: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            before,
            offset: 0,
            continuation: None,
        }
    }

    /// The request for the page older than `page`, or `None` when nothing
    /// older can exist.
    ///
    /// While the previous window still holds unreturned messages this pages
    /// through it; once it is exhausted a fresh search starts at the oldest
    /// point `page` reached.
    pub fn continue_from(
        conversation_id: impl Into<String>,
        before: DateTime<Utc>,
        page: &HistoryPage,
    ) -> Option<Self> {
        if !page.has_more {
            return None;
        }
        if page.next_offset > 0 {
            return Some(Self {
                conversation_id: conversation_id.into(),
                before,
                offset: page.next_offset,
                continuation: Some(page.time_range_used),
            });
        }

        let resume = page
            .messages
            .first()
            .map(|message| message.timestamp)
            .or_else(|| page.gap.as_ref().map(|gap| gap.suggested_resume))
            .unwrap_or(page.time_range_used.start);
        Some(Self::new(conversation_id, resume.min(before)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Oldest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub time_range_used: TimeWindow,
    /// Offset for the next, older page within `time_range_used`; zero once
    /// the window is exhausted.
    pub next_offset: usize,
    pub gap: Option<GapSentinel>,
}

/// Messages per day across the cached real messages, if at least two of them
/// span a positive duration.
pub fn estimate_density(entries: &[TimelineEntry]) -> Option<f64> {
    let mut count = 0usize;
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;
    for message in real_messages(entries) {
        count += 1;
        earliest = Some(earliest.map_or(message.timestamp, |ts| ts.min(message.timestamp)));
        latest = Some(latest.map_or(message.timestamp, |ts| ts.max(message.timestamp)));
    }

    let (earliest, latest) = (earliest?, latest?);
    let span_days = (latest - earliest).num_milliseconds() as f64 / MILLIS_PER_DAY;
    if count < 2 || span_days <= 0.0 {
        return None;
    }
    Some(count as f64 / span_days)
}

pub fn initial_window_days(config: &HistoryConfig, density: f64) -> f64 {
    let density = if density > 0.0 {
        density
    } else {
        config.default_density_per_day
    };
    (config.page_size as f64 / density).clamp(config.min_window_days, config.max_window_days)
}

#[derive(Clone)]
pub struct HistoryFetcher {
    source: Arc<dyn ChatlogSource>,
    cache: MessageCache,
    config: HistoryConfig,
    zone: CivilZone,
}

impl HistoryFetcher {
    pub fn new(
        source: Arc<dyn ChatlogSource>,
        cache: MessageCache,
        config: HistoryConfig,
        zone: CivilZone,
    ) -> Self {
        Self {
            source,
            cache,
            config,
            zone,
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Loads one page and commits what it learned (messages or a gap) into
    /// the cache. Returns the page with the committed entry set.
    pub async fn load(
        &self,
        request: &HistoryRequest,
    ) -> Result<(HistoryPage, Option<Vec<TimelineEntry>>), SyncError> {
        let cached = self.cache.get(&request.conversation_id).await?;
        let page = match request.continuation {
            Some(window) => self.continue_window(request, window).await?,
            None => self.search(request, cached.as_deref()).await?,
        };

        if page.messages.is_empty() && page.gap.is_none() {
            return Ok((page, None));
        }

        let mut learned: Vec<TimelineEntry> =
            page.messages.iter().cloned().map(TimelineEntry::Message).collect();
        if let Some(gap) = &page.gap {
            learned.push(TimelineEntry::Gap(gap.clone()));
        }
        let commit = self
            .cache
            .commit_with(&request.conversation_id, |previous| {
                merge_timeline(previous.unwrap_or_default(), &learned, None)
            })
            .await?;

        Ok((page, Some(commit.entries)))
    }

    async fn search(
        &self,
        request: &HistoryRequest,
        cached: Option<&[TimelineEntry]>,
    ) -> Result<HistoryPage, SyncError> {
        let density = cached
            .and_then(estimate_density)
            .unwrap_or(self.config.default_density_per_day);
        let mut window_days = initial_window_days(&self.config, density);
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempts = 0u32;
        let (window, found) = loop {
            attempts += 1;
            let window = TimeWindow::ending_at(request.before, window_days);
            let found = self.read_window(request, window).await?;

            tracing::debug!(
                conversation = %request.conversation_id,
                attempt = attempts,
                window_days,
                found = found.len(),
                "history window searched"
            );

            if !found.is_empty()
                || attempts >= max_attempts
                || window_days >= self.config.max_window_days
            {
                break (window, found);
            }
            window_days = (window_days * 2.0).min(self.config.max_window_days);
        };

        if !found.is_empty() || request.offset > 0 {
            return Ok(self.newest_page(found, request.offset, window));
        }

        let anchor = cached.and_then(|entries| {
            real_messages(entries)
                .map(|message| message.timestamp)
                .filter(|ts| *ts >= request.before)
                .min()
        });
        let gap = GapSentinel::new(request.conversation_id.clone(), window, anchor, attempts);

        tracing::info!(
            conversation = %request.conversation_id,
            from = %self.zone.format_timestamp(window.start),
            to = %self.zone.format_timestamp(window.end),
            attempts,
            "no history found, recording gap"
        );

        // Older history may lie beyond the searched window; the caller
        // resumes from the gap's suggested resume point.
        Ok(HistoryPage {
            messages: Vec::new(),
            has_more: true,
            time_range_used: window,
            next_offset: 0,
            gap: Some(gap),
        })
    }

    async fn continue_window(
        &self,
        request: &HistoryRequest,
        window: TimeWindow,
    ) -> Result<HistoryPage, SyncError> {
        let records = self.read_window(request, window).await?;
        Ok(self.newest_page(records, request.offset, window))
    }

    /// Every message of `window` older than the anchor, oldest first.
    ///
    /// The archive serves a date range oldest first, so the window is read
    /// page by page until a short page or a record at the anchor shows
    /// nothing older is left unread.
    async fn read_window(
        &self,
        request: &HistoryRequest,
        window: TimeWindow,
    ) -> Result<Vec<Message>, SyncError> {
        let range = window.to_date_range(&self.zone);
        let page_size = self.config.page_size;
        let mut kept = Vec::new();
        let mut offset = 0;

        for _ in 0..MAX_WINDOW_READS {
            let query = ChatlogQuery::new(request.conversation_id.clone(), range, page_size)
                .with_offset(offset);
            let fetched = self.source.fetch_messages(&query).await?;
            let raw_len = fetched.len();
            let reached_anchor = fetched.iter().any(|message| message.timestamp >= request.before);
            kept.extend(
                fetched
                    .into_iter()
                    .filter(|message| message.timestamp < request.before),
            );

            if raw_len < page_size || reached_anchor {
                break;
            }
            offset += raw_len;
        }
        Ok(dedup_sorted(kept))
    }

    /// Cuts the page that ends `offset` messages before the newer end of
    /// `records`.
    fn newest_page(
        &self,
        mut records: Vec<Message>,
        offset: usize,
        window: TimeWindow,
    ) -> HistoryPage {
        let end = records.len().saturating_sub(offset);
        let start = end.saturating_sub(self.config.page_size);
        let messages: Vec<Message> = records.drain(start..end).collect();
        let next_offset = if start > 0 {
            offset + messages.len()
        } else {
            0
        };

        // A page with messages never proves the conversation starts there.
        HistoryPage {
            messages,
            has_more: true,
            time_range_used: window,
            next_offset,
            gap: None,
        }
    }
}
