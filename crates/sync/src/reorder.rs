use tern_protocol::{SessionId, SessionRecord};

/// Moves the session with `id` to position 0.
///
/// The remaining entries keep their relative order. Returns `false` when the
/// id is absent or already first.
pub fn promote_to_front(sessions: &mut [SessionRecord], id: SessionId) -> bool {
    match sessions.iter().position(|session| session.id == id) {
        Some(0) | None => false,
        Some(position) => {
            sessions[..=position].rotate_right(1);
            true
        }
    }
}
