use tern_protocol::SessionId;

use super::message::TranscriptSlot;
use super::reconciler::SendState;

/// Change notifications published by `ChatStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    DirectoryChanged,
    TranscriptReplaced {
        session_id: SessionId,
        generation: u64,
    },
    /// The user entry and the assistant placeholder were appended.
    SendStarted {
        session_id: SessionId,
        slot: TranscriptSlot,
    },
    FragmentApplied {
        slot: TranscriptSlot,
        text: String,
    },
    SendFinished {
        session_id: SessionId,
        slot: Option<TranscriptSlot>,
        state: SendState,
    },
    TitleChanged {
        session_id: SessionId,
        title: String,
    },
}
