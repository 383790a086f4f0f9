//! Deduplicating merge of a cached timeline with freshly fetched entries.
//!
//! Real messages are identified by [`MessageKey`]; a record sharing a key with
//! an existing one but carrying a different payload is kept as a separate
//! entry. Gap sentinels are coalesced and narrowed so they never claim a range
//! that holds a known message.

use chatlog_core::{GapSentinel, Message, MessageKey, TimelineEntry};
use std::collections::HashMap;

/// Merges `fetched` into `cached`, sorted in timeline order.
///
/// With `max_retained`, the oldest entries are dropped until the result fits.
pub fn merge_timeline(
    cached: &[TimelineEntry],
    fetched: &[TimelineEntry],
    max_retained: Option<usize>,
) -> Vec<TimelineEntry> {
    let mut messages: Vec<Message> = Vec::new();
    let mut by_key: HashMap<MessageKey, Vec<usize>> = HashMap::new();
    let mut gaps: Vec<GapSentinel> = Vec::new();

    for entry in cached.iter().chain(fetched) {
        match entry {
            TimelineEntry::Message(message) => {
                let slots = by_key.entry(message.key()).or_default();
                if slots.iter().any(|&idx| messages[idx].same_payload(message)) {
                    continue;
                }
                slots.push(messages.len());
                messages.push(message.clone());
            }
            TimelineEntry::Gap(gap) => gaps.push(gap.clone()),
        }
    }

    let gaps = narrow_gaps(coalesce_gaps(gaps), &messages);

    let mut merged: Vec<TimelineEntry> = messages
        .into_iter()
        .map(TimelineEntry::Message)
        .chain(gaps.into_iter().map(TimelineEntry::Gap))
        .collect();
    merged.sort_by(|a, b| a.timeline_cmp(b));

    if let Some(limit) = max_retained {
        if merged.len() > limit {
            let excess = merged.len() - limit;
            merged.drain(..excess);
        }
    }
    merged
}

/// Messages-only convenience over [`merge_timeline`].
pub fn merge_messages(
    cached: &[TimelineEntry],
    fetched: &[Message],
    max_retained: Option<usize>,
) -> Vec<TimelineEntry> {
    let fetched: Vec<TimelineEntry> =
        fetched.iter().cloned().map(TimelineEntry::Message).collect();
    merge_timeline(cached, &fetched, max_retained)
}

/// Deduplicates a fetched batch on its own and sorts it.
pub fn dedup_sorted(messages: Vec<Message>) -> Vec<Message> {
    merge_messages(&[], &messages, None)
        .into_iter()
        .filter_map(|entry| match entry {
            TimelineEntry::Message(message) => Some(message),
            TimelineEntry::Gap(_) => None,
        })
        .collect()
}

fn coalesce_gaps(mut gaps: Vec<GapSentinel>) -> Vec<GapSentinel> {
    gaps.sort_by(|a, b| {
        a.conversation_id
            .cmp(&b.conversation_id)
            .then_with(|| a.covered.start.cmp(&b.covered.start))
    });

    let mut out: Vec<GapSentinel> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        match out.last_mut() {
            Some(last)
                if last.conversation_id == gap.conversation_id
                    && last.covered.overlaps(&gap.covered) =>
            {
                if gap.covered.end > last.covered.end {
                    last.anchor_timestamp = gap.anchor_timestamp;
                } else if gap.covered.end == last.covered.end {
                    last.anchor_timestamp = last.anchor_timestamp.or(gap.anchor_timestamp);
                }
                last.covered = last.covered.union(&gap.covered);
                last.attempts_exhausted = last.attempts_exhausted.max(gap.attempts_exhausted);
                last.suggested_resume = last.suggested_resume.min(gap.suggested_resume);
            }
            _ => out.push(gap),
        }
    }
    out
}

/// Cuts each gap back to `[start, earliest message inside it)`; a gap whose
/// start already holds a message is dropped.
fn narrow_gaps(gaps: Vec<GapSentinel>, messages: &[Message]) -> Vec<GapSentinel> {
    gaps.into_iter()
        .filter_map(|mut gap| {
            let earliest_inside = messages
                .iter()
                .filter(|message| message.conversation_id == gap.conversation_id)
                .map(|message| message.timestamp)
                .filter(|ts| gap.covered.start <= *ts && *ts < gap.covered.end)
                .min();

            match earliest_inside {
                None => Some(gap),
                Some(ts) if ts == gap.covered.start => None,
                Some(ts) => {
                    gap.covered.end = ts;
                    gap.anchor_timestamp = Some(ts);
                    gap.suggested_resume = gap.suggested_resume.min(gap.covered.start);
                    Some(gap)
                }
            }
        })
        .collect()
}
