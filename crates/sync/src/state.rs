use std::future::Future;

use tern_protocol::{SessionId, SessionRecord};
use tokio::sync::RwLock;

use super::conversation::ActiveConversation;
use super::directory::SessionDirectory;
use super::error::SyncResult;
use super::message::Message;

/// Everything the client shows, guarded by one lock inside `ChatStore`.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub directory: SessionDirectory,
    pub conversation: ActiveConversation,
}

impl ChatState {
    pub fn snapshot(&self, sending: bool) -> ChatSnapshot {
        ChatSnapshot {
            sessions: self.directory.list().to_vec(),
            active_session: self.conversation.session().cloned(),
            transcript: self.conversation.transcript().to_vec(),
            generation: self.conversation.generation(),
            sending,
        }
    }
}

/// Owned copy of the state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub sessions: Vec<SessionRecord>,
    pub active_session: Option<SessionRecord>,
    pub transcript: Vec<Message>,
    pub generation: u64,
    pub sending: bool,
}

impl ChatSnapshot {
    pub fn active_session_id(&self) -> Option<SessionId> {
        self.active_session.as_ref().map(|session| session.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredSession {
    pub session: SessionRecord,
    pub created: bool,
}

/// Returns the selected session, creating one through `create_fn` when none is selected.
///
/// `create_fn` runs with the lock released. A created session goes to the top
/// of the directory and becomes active unless another session was selected
/// while it was being created.
pub async fn ensure_session<F, Fut>(
    state: &RwLock<ChatState>,
    create_fn: F,
) -> SyncResult<EnsuredSession>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<SessionRecord>>,
{
    if let Some(session) = state.read().await.conversation.session().cloned() {
        return Ok(EnsuredSession {
            session,
            created: false,
        });
    }

    let session = create_fn().await?;

    let mut guard = state.write().await;
    guard.directory.upsert_at_front(session.clone());
    if guard.conversation.session().is_none() {
        guard.conversation.replace(session.clone(), Vec::new());
    }

    Ok(EnsuredSession {
        session,
        created: true,
    })
}
