use snafu::Snafu;
use tern_backend::BackendError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("failed to create a session on `{stage}`, {source}"))]
    CreateSession {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("backend call failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("backend could not extract `{filename}`: {reason}"))]
    UploadRejected {
        stage: &'static str,
        filename: String,
        reason: String,
    },
    #[snafu(display("a reply is already streaming"))]
    SendInFlight { stage: &'static str },
    #[snafu(display("message has no content"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("session title is empty"))]
    EmptyTitle { stage: &'static str },
    #[snafu(display(
        "slot {index}@{generation} is no longer valid (generation {current_generation}, {len} messages)"
    ))]
    IndexOutOfRange {
        stage: &'static str,
        index: usize,
        generation: u64,
        current_generation: u64,
        len: usize,
    },
    #[snafu(display("message at {index} is already finished"))]
    MessageFrozen { stage: &'static str, index: usize },
}

impl SyncError {
    /// True when the failure only means a stream target went stale.
    pub fn is_stale_target(&self) -> bool {
        matches!(
            self,
            Self::IndexOutOfRange { .. } | Self::MessageFrozen { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
