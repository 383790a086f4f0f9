use crate::ApiError;
use async_trait::async_trait;
use chatlog_core::{CivilDateRange, ConversationSummary, Message};
use serde::{Deserialize, Serialize};

/// One `(conversation, civil date range, limit, offset)` lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatlogQuery {
    pub conversation_id: String,
    pub range: CivilDateRange,
    pub limit: usize,
    pub offset: usize,
}

impl ChatlogQuery {
    pub fn new(conversation_id: impl Into<String>, range: CivilDateRange, limit: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            range,
            limit,
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Read-only view of the remote chat archive.
#[async_trait]
pub trait ChatlogSource: Send + Sync {
    async fn fetch_messages(&self, query: &ChatlogQuery) -> Result<Vec<Message>, ApiError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError>;
}
