use crate::time::TimeWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    Video,
    Emoji,
    /// App/file payloads. Quoted replies arrive with this kind too.
    File,
    System,
    Revoke,
    Other(i64),
}

impl MessageKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Text,
            3 => Self::Image,
            34 => Self::Voice,
            43 => Self::Video,
            47 => Self::Emoji,
            49 => Self::File,
            10000 => Self::System,
            10002 => Self::Revoke,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Text => 1,
            Self::Image => 3,
            Self::Voice => 34,
            Self::Video => 43,
            Self::Emoji => 47,
            Self::File => 49,
            Self::System => 10000,
            Self::Revoke => 10002,
            Self::Other(code) => *code,
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Text
    }
}

/// Identity of an archived message: `(seq, timestamp, conversation)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub conversation_id: String,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub is_outgoing: bool,
    pub kind: MessageKind,
    #[serde(default)]
    pub sub_kind: i64,
    #[serde(default)]
    pub content: String,
    /// Kind-specific structured payload (media urls, file names, quote data).
    #[serde(default)]
    pub contents: Option<serde_json::Value>,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            seq: self.seq,
            timestamp: self.timestamp,
            conversation_id: self.conversation_id.clone(),
        }
    }

    /// Field-by-field comparison used once two records share a [`MessageKey`].
    pub fn same_payload(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id
            && self.kind == other.kind
            && self.sub_kind == other.sub_kind
            && self.content == other.content
            && self.contents == other.contents
    }
}

/// Marker recording that a time window was searched and held no messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapSentinel {
    pub conversation_id: String,
    pub covered: TimeWindow,
    /// Newest real message bordering the gap on its newer side.
    pub anchor_timestamp: Option<DateTime<Utc>>,
    pub attempts_exhausted: u32,
    pub suggested_resume: DateTime<Utc>,
}

impl GapSentinel {
    pub fn new(
        conversation_id: impl Into<String>,
        covered: TimeWindow,
        anchor_timestamp: Option<DateTime<Utc>>,
        attempts_exhausted: u32,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            suggested_resume: covered.start,
            covered,
            anchor_timestamp,
            attempts_exhausted,
        }
    }
}

/// One slot of a cached conversation timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TimelineEntry {
    Message(Message),
    Gap(GapSentinel),
}

impl TimelineEntry {
    /// Sort position. Gaps sit at the newer edge of the window they cover.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Message(message) => message.timestamp,
            Self::Gap(gap) => gap.covered.end,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Message(message) => &message.conversation_id,
            Self::Gap(gap) => &gap.conversation_id,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(message) => Some(message),
            Self::Gap(_) => None,
        }
    }

    pub fn as_gap(&self) -> Option<&GapSentinel> {
        match self {
            Self::Gap(gap) => Some(gap),
            Self::Message(_) => None,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap(_))
    }

    /// Timeline ordering: time ascending, a gap before a real message at the
    /// same instant, then sequence number.
    pub fn timeline_cmp(&self, other: &TimelineEntry) -> Ordering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| other.is_gap().cmp(&self.is_gap()))
            .then_with(|| match (self, other) {
                (Self::Message(a), Self::Message(b)) => a.seq.cmp(&b.seq),
                (Self::Gap(a), Self::Gap(b)) => a.covered.start.cmp(&b.covered.start),
                _ => Ordering::Equal,
            })
    }
}

impl From<Message> for TimelineEntry {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<GapSentinel> for TimelineEntry {
    fn from(gap: GapSentinel) -> Self {
        Self::Gap(gap)
    }
}

/// Real messages of a timeline, in timeline order.
pub fn real_messages(entries: &[TimelineEntry]) -> impl Iterator<Item = &Message> {
    entries.iter().filter_map(TimelineEntry::as_message)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Private,
    Group,
    Official,
    Unknown,
}

impl ConversationKind {
    pub fn from_conversation_id(id: &str) -> Self {
        if id.contains("@chatroom") {
            Self::Group
        } else if id.starts_with("gh_") {
            Self::Official
        } else if id.contains("@placeholder_foldgroup")
            || id.contains("brandsessionholder")
            || id.contains("brandservicesessionholder")
        {
            Self::Unknown
        } else {
            Self::Private
        }
    }
}

/// Entry of the remote conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub display_name: String,
    pub kind: ConversationKind,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
}
