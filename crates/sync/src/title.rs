use tern_protocol::{PLACEHOLDER_SESSION_TITLE, SessionId};

use super::state::ChatState;

/// What title reconciliation did after a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleOutcome {
    /// The send did not complete, so no title was fetched.
    NotAttempted,
    /// The backend still reports the placeholder title.
    Placeholder,
    Unchanged,
    Updated { title: String },
    /// The session could not be re-fetched; titles were left as they were.
    FetchFailed,
}

impl TitleOutcome {
    pub fn updated_title(&self) -> Option<&str> {
        match self {
            Self::Updated { title } => Some(title),
            _ => None,
        }
    }
}

/// Writes `title` to the directory entry and, when it is still selected,
/// to the active session.
pub fn propagate_title(state: &mut ChatState, id: SessionId, title: &str) -> TitleOutcome {
    let in_directory = state.directory.rename(id, title);
    let in_conversation = state.conversation.set_title_if_current(id, title);

    if in_directory || in_conversation {
        TitleOutcome::Updated {
            title: title.to_string(),
        }
    } else {
        TitleOutcome::Unchanged
    }
}

/// Applies the backend's canonical title unless it is still the placeholder.
pub fn reconcile_title(state: &mut ChatState, id: SessionId, canonical: &str) -> TitleOutcome {
    if canonical == PLACEHOLDER_SESSION_TITLE {
        return TitleOutcome::Placeholder;
    }
    propagate_title(state, id, canonical)
}
