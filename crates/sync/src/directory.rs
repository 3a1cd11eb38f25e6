use tern_protocol::{SessionId, SessionRecord};

use super::reorder::promote_to_front;

/// Ordered list of the user's sessions, most recently active first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDirectory {
    sessions: Vec<SessionRecord>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> &[SessionRecord] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionRecord> {
        self.sessions.iter().find(|session| session.id == id)
    }

    pub fn position(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|session| session.id == id)
    }

    /// Replaces the whole list with the backend's ordering.
    pub fn replace_all(&mut self, sessions: Vec<SessionRecord>) {
        self.sessions = sessions;
    }

    /// Inserts a newly created session at the top.
    ///
    /// An entry with the same id is left where it is. Returns whether the list changed.
    pub fn upsert_at_front(&mut self, session: SessionRecord) -> bool {
        if self.position(session.id).is_some() {
            return false;
        }
        self.sessions.insert(0, session);
        true
    }

    /// Sets the title of the matching entry. Unknown ids are ignored.
    pub fn rename(&mut self, id: SessionId, title: &str) -> bool {
        match self.sessions.iter_mut().find(|session| session.id == id) {
            Some(session) if session.title != title => {
                session.title = title.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn promote(&mut self, id: SessionId) -> bool {
        promote_to_front(&mut self.sessions, id)
    }
}
