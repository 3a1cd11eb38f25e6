use snafu::ensure;
use tern_protocol::{SessionId, SessionRecord};

use super::error::{IndexOutOfRangeSnafu, MessageFrozenSnafu, SyncResult};
use super::message::{Message, MessageStatus, TranscriptSlot};

/// The session currently on screen and its transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveConversation {
    session: Option<SessionRecord>,
    transcript: Vec<Message>,
    generation: u64,
}

impl ActiveConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&SessionRecord> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Swaps in another session wholesale.
    ///
    /// Every slot issued before this call stops matching.
    pub fn replace(&mut self, session: SessionRecord, transcript: Vec<Message>) -> u64 {
        self.session = Some(session);
        self.transcript = transcript;
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub fn append_user_placeholder(&mut self, content: impl Into<String>) -> TranscriptSlot {
        self.push(Message::user(content))
    }

    pub fn append_assistant_placeholder(&mut self, model: impl Into<String>) -> TranscriptSlot {
        self.push(Message::assistant_placeholder(model))
    }

    fn push(&mut self, message: Message) -> TranscriptSlot {
        self.transcript.push(message);
        TranscriptSlot::new(self.generation, self.transcript.len() - 1)
    }

    /// Appends raw fragment text to the entry at `slot`.
    pub fn append_to_index(&mut self, slot: TranscriptSlot, fragment: &str) -> SyncResult<()> {
        let message = self.streaming_message_mut(slot, "append-to-index")?;
        message.content.push_str(fragment);
        Ok(())
    }

    /// Freezes the entry at `slot` with a terminal status.
    pub fn finish(&mut self, slot: TranscriptSlot, status: MessageStatus) -> SyncResult<()> {
        let message = self.streaming_message_mut(slot, "finish-message")?;
        message.status = status;
        Ok(())
    }

    pub fn message(&self, slot: TranscriptSlot) -> Option<&Message> {
        if slot.generation != self.generation {
            return None;
        }
        self.transcript.get(slot.index)
    }

    /// Updates the title only while `id` is still the selected session.
    pub fn set_title_if_current(&mut self, id: SessionId, title: &str) -> bool {
        match self.session.as_mut() {
            Some(session) if session.id == id && session.title != title => {
                session.title = title.to_string();
                true
            }
            _ => false,
        }
    }

    fn streaming_message_mut(
        &mut self,
        slot: TranscriptSlot,
        stage: &'static str,
    ) -> SyncResult<&mut Message> {
        let current_generation = self.generation;
        let len = self.transcript.len();
        ensure!(
            slot.generation == current_generation && slot.index < len,
            IndexOutOfRangeSnafu {
                stage,
                index: slot.index,
                generation: slot.generation,
                current_generation,
                len,
            }
        );

        let message = &mut self.transcript[slot.index];
        ensure!(
            !message.status.is_terminal(),
            MessageFrozenSnafu {
                stage,
                index: slot.index,
            }
        );
        Ok(message)
    }
}
