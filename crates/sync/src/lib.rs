//! Keeps the session directory and the active conversation in step with the
//! chat backend while replies stream in.

mod conversation;
mod directory;
mod error;
mod events;
mod message;
mod reconciler;
mod reorder;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod title;

pub use conversation::ActiveConversation;
pub use directory::SessionDirectory;
pub use error::{SyncError, SyncResult};
pub use events::ChatEvent;
pub use message::{Message, MessageStatus, TranscriptSlot};
pub use reconciler::{
    DOCUMENT_CONTEXT_SUFFIX, ERROR_MARKER, SendOutcome, SendRequest, SendState, display_content,
};
pub use reorder::promote_to_front;
pub use state::{ChatSnapshot, ChatState, EnsuredSession, ensure_session};
pub use store::ChatStore;
pub use title::{TitleOutcome, propagate_title, reconcile_title};
