use chrono::{DateTime, Utc};
use tern_protocol::{MessageId, MessageRecord, MessageRole};

/// Lifecycle status for one transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Streaming,
    Done,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

/// One transcript entry as the client shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub model: Option<String>,
    pub status: MessageStatus,
}

impl Message {
    /// Optimistic user entry, shown before the backend has seen it.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: MessageRole::User,
            content: content.into(),
            created_at: Utc::now(),
            model: None,
            status: MessageStatus::Done,
        }
    }

    /// Empty assistant entry that receives streamed fragments.
    pub fn assistant_placeholder(model: impl Into<String>) -> Self {
        Self {
            id: None,
            role: MessageRole::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            model: Some(model.into()),
            status: MessageStatus::Streaming,
        }
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            role: record.role,
            content: record.content,
            created_at: record.created_at,
            model: record.model,
            status: MessageStatus::Done,
        }
    }
}

/// Transcript position issued to one stream.
///
/// The generation changes whenever the transcript is replaced, so a slot
/// issued before a session switch never matches again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TranscriptSlot {
    pub generation: u64,
    pub index: usize,
}

impl TranscriptSlot {
    pub const fn new(generation: u64, index: usize) -> Self {
        Self { generation, index }
    }
}
