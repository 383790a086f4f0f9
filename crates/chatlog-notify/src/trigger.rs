use chatlog_config::NotificationConfig;
use chatlog_core::{real_messages, Message, MessageKey, MessageKind, TimelineEntry};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

const PREVIEW_CHARS: usize = 50;
const MENTION_ALL: [&str; 2] = ["@所有人", "@All"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Mention,
    Quote,
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub conversation_id: String,
    pub title: String,
    pub body: String,
    pub key: MessageKey,
}

/// Tracks which messages have already produced a notification.
pub struct NotificationTrigger {
    config: NotificationConfig,
    quote_pattern: Option<Regex>,
    notified: HashSet<MessageKey>,
    notified_order: VecDeque<MessageKey>,
}

impl NotificationTrigger {
    pub fn new(config: NotificationConfig) -> Self {
        let quote_pattern = build_quote_pattern(config.my_id.as_deref());
        Self {
            config,
            quote_pattern,
            notified: HashSet::new(),
            notified_order: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: NotificationConfig) {
        self.quote_pattern = build_quote_pattern(config.my_id.as_deref());
        self.config = config;
        self.prune();
    }

    pub fn is_muted(&self, conversation_id: &str) -> bool {
        self.config.mute_list.iter().any(|id| id == conversation_id)
    }

    pub fn notified_count(&self) -> usize {
        self.notified.len()
    }

    /// Notifications for messages in `fetched` that are absent from `previous`.
    ///
    /// Without a previous snapshot nothing is reported: a first load is not
    /// new traffic.
    pub fn evaluate(
        &mut self,
        conversation_id: &str,
        conversation_name: Option<&str>,
        previous: Option<&[TimelineEntry]>,
        fetched: &[TimelineEntry],
    ) -> Vec<NotificationRequest> {
        if !self.config.enabled {
            return Vec::new();
        }
        let Some(previous) = previous.filter(|entries| !entries.is_empty()) else {
            return Vec::new();
        };
        if self.is_muted(conversation_id) {
            return Vec::new();
        }

        let known: HashSet<MessageKey> = real_messages(previous).map(Message::key).collect();
        let conversation_name = conversation_name.unwrap_or(conversation_id);

        let mut requests = Vec::new();
        for message in real_messages(fetched) {
            let key = message.key();
            if known.contains(&key) || self.notified.contains(&key) {
                continue;
            }
            let Some(kind) = self.classify(message) else {
                continue;
            };
            requests.push(self.build_request(kind, conversation_name, message));
            self.remember(key);
        }

        if !requests.is_empty() {
            tracing::debug!(
                conversation = %conversation_id,
                count = requests.len(),
                "new messages qualify for notification"
            );
        }
        requests
    }

    pub fn classify(&self, message: &Message) -> Option<NotificationKind> {
        if message.is_outgoing {
            return None;
        }
        if self.config.enable_mention && self.is_mentioned(message) {
            return Some(NotificationKind::Mention);
        }
        if self.config.enable_quote && self.is_quoted(message) {
            return Some(NotificationKind::Quote);
        }
        if self.config.enable_message {
            return Some(NotificationKind::Message);
        }
        None
    }

    fn is_mentioned(&self, message: &Message) -> bool {
        let Some(my_id) = self.config.my_id.as_deref() else {
            return false;
        };
        if message.kind != MessageKind::Text || message.content.is_empty() {
            return false;
        }
        let content = &message.content;
        if MENTION_ALL.iter().any(|tag| content.contains(tag)) {
            return true;
        }
        if content.contains(&format!("@{my_id}")) {
            return true;
        }
        self.config
            .my_display_names
            .iter()
            .filter(|name| !name.is_empty())
            .any(|name| content.contains(&format!("@{name}")))
    }

    /// Quoted replies arrive as app payloads whose `<refermsg>` block names
    /// the quoted author in `<chatusr>`.
    fn is_quoted(&self, message: &Message) -> bool {
        let Some(my_id) = self.config.my_id.as_deref() else {
            return false;
        };
        if message.kind != MessageKind::File {
            return false;
        }
        if let Some(pattern) = &self.quote_pattern {
            if pattern.is_match(&message.content) {
                return true;
            }
        }
        !message.content.contains("<refermsg>") && message.content.contains(my_id)
    }

    fn build_request(
        &self,
        kind: NotificationKind,
        conversation_name: &str,
        message: &Message,
    ) -> NotificationRequest {
        let sender = message
            .sender_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&message.sender_id);

        let (title, body) = if self.config.show_message_content {
            let preview = preview(message);
            let title = match kind {
                NotificationKind::Mention => {
                    format!("{conversation_name} - {sender} mentioned you")
                }
                NotificationKind::Quote => format!("{conversation_name} - {sender} quoted you"),
                NotificationKind::Message => format!("{conversation_name} - {sender}"),
            };
            (title, preview)
        } else {
            let body = match kind {
                NotificationKind::Mention => format!("{sender} mentioned you"),
                NotificationKind::Quote => format!("{sender} quoted you"),
                NotificationKind::Message => format!("{sender} sent a new message"),
            };
            (conversation_name.to_string(), body)
        };

        NotificationRequest {
            kind,
            conversation_id: message.conversation_id.clone(),
            title,
            body,
            key: message.key(),
        }
    }

    fn remember(&mut self, key: MessageKey) {
        if self.notified.insert(key.clone()) {
            self.notified_order.push_back(key);
        }
        self.prune();
    }

    fn prune(&mut self) {
        while self.notified_order.len() > self.config.max_tracked_ids {
            if let Some(oldest) = self.notified_order.pop_front() {
                self.notified.remove(&oldest);
            }
        }
    }
}

fn build_quote_pattern(my_id: Option<&str>) -> Option<Regex> {
    let my_id = my_id.filter(|id| !id.is_empty())?;
    Regex::new(&format!(
        r"(?s)<refermsg>.*<chatusr>\s*{}\s*</chatusr>",
        regex::escape(my_id)
    ))
    .ok()
}

fn preview(message: &Message) -> String {
    match message.kind {
        MessageKind::Text => {
            if message.content.is_empty() {
                return "New message".to_string();
            }
            let mut chars = message.content.chars();
            let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
            if chars.next().is_some() {
                format!("{head}...")
            } else {
                head
            }
        }
        MessageKind::Image => "[Image]".to_string(),
        MessageKind::Voice => "[Voice]".to_string(),
        MessageKind::Video => "[Video]".to_string(),
        MessageKind::Emoji => "[Sticker]".to_string(),
        MessageKind::File => "[File]".to_string(),
        _ => "New message".to_string(),
    }
}
