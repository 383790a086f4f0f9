//! Scripted in-process archive used by the sync tests.

use async_trait::async_trait;
use chatlog_api::{ApiError, ChatlogQuery, ChatlogSource};
use chatlog_core::{CivilZone, ConversationKind, ConversationSummary, Message, MessageKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn message(conversation_id: &str, seq: i64, timestamp: DateTime<Utc>) -> Message {
    Message {
        conversation_id: conversation_id.to_string(),
        seq,
        timestamp,
        sender_id: format!("{conversation_id}-peer"),
        sender_name: None,
        is_outgoing: false,
        kind: MessageKind::Text,
        sub_kind: 0,
        content: format!("message {seq}"),
        contents: None,
    }
}

#[derive(Default)]
struct FakeState {
    archive: HashMap<String, Vec<Message>>,
    conversations: Vec<ConversationSummary>,
    queries: Vec<ChatlogQuery>,
    failures: HashMap<String, u32>,
    in_flight: HashMap<String, usize>,
    max_in_flight_per_conversation: usize,
    in_flight_total: usize,
    max_in_flight_total: usize,
}

pub struct FakeSource {
    zone: CivilZone,
    state: Arc<Mutex<FakeState>>,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            zone: CivilZone::default(),
            state: Arc::new(Mutex::new(FakeState::default())),
            gate: None,
            delay: Duration::ZERO,
        }
    }

    /// Every fetch waits for a permit released through [`FakeSource::release`].
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn add_messages(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.state.lock().unwrap();
        for message in messages {
            state
                .archive
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
    }

    pub fn set_conversation(&self, id: &str, last_activity: Option<DateTime<Utc>>) {
        let mut state = self.state.lock().unwrap();
        state.conversations.retain(|c| c.id != id);
        state.conversations.push(ConversationSummary {
            id: id.to_string(),
            display_name: id.to_string(),
            kind: ConversationKind::from_conversation_id(id),
            last_activity,
            last_message_preview: None,
        });
    }

    /// The next `count` fetches for `conversation_id` fail with a 503.
    pub fn fail_next(&self, conversation_id: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(conversation_id.to_string(), count);
    }

    pub fn queries(&self) -> Vec<ChatlogQuery> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn started_order(&self) -> Vec<String> {
        self.queries().into_iter().map(|q| q.conversation_id).collect()
    }

    pub fn max_in_flight_per_conversation(&self) -> usize {
        self.state.lock().unwrap().max_in_flight_per_conversation
    }

    pub fn max_in_flight_total(&self) -> usize {
        self.state.lock().unwrap().max_in_flight_total
    }
}

struct InFlight {
    state: Arc<Mutex<FakeState>>,
    conversation_id: String,
}

impl InFlight {
    fn enter(state: Arc<Mutex<FakeState>>, query: &ChatlogQuery) -> Self {
        {
            let mut guard = state.lock().unwrap();
            guard.queries.push(query.clone());
            let per = guard.in_flight.entry(query.conversation_id.clone()).or_insert(0);
            *per += 1;
            let per = *per;
            guard.max_in_flight_per_conversation = guard.max_in_flight_per_conversation.max(per);
            guard.in_flight_total += 1;
            guard.max_in_flight_total = guard.max_in_flight_total.max(guard.in_flight_total);
        }
        Self {
            state,
            conversation_id: query.conversation_id.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut guard = self.state.lock().unwrap();
        if let Some(per) = guard.in_flight.get_mut(&self.conversation_id) {
            *per = per.saturating_sub(1);
        }
        guard.in_flight_total = guard.in_flight_total.saturating_sub(1);
    }
}

#[async_trait]
impl ChatlogSource for FakeSource {
    async fn fetch_messages(&self, query: &ChatlogQuery) -> Result<Vec<Message>, ApiError> {
        let _in_flight = InFlight::enter(self.state.clone(), query);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.failures.get_mut(&query.conversation_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ApiError::Status {
                    status: 503,
                    body: "scripted failure".to_string(),
                });
            }
        }

        let mut matching: Vec<Message> = state
            .archive
            .get(&query.conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| query.range.contains(self.zone.date_of(m.timestamp)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        Ok(self.state.lock().unwrap().conversations.clone())
    }
}
