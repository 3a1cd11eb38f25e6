use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::{ResultExt, ensure};
use tern_backend::ChatBackend;
use tern_protocol::{
    ExtractedDocument, PLACEHOLDER_SESSION_TITLE, SessionDetail, SessionId, SessionRecord,
    UploadResult,
};
use tokio::sync::{RwLock, broadcast, oneshot};

use super::error::{
    BackendSnafu, CreateSessionSnafu, EmptyMessageSnafu, EmptyTitleSnafu, SendInFlightSnafu,
    SyncResult, UploadRejectedSnafu,
};
use super::events::ChatEvent;
use super::message::Message;
use super::reconciler::{SendOutcome, SendRequest, StreamReconciler};
use super::state::{ChatSnapshot, ChatState};
use super::title::{TitleOutcome, propagate_title};

const EVENT_CAPACITY: usize = 1024;

/// Client-side chat state plus the backend it is synchronized with.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Arc<dyn ChatBackend>,
    state: RwLock<ChatState>,
    events: broadcast::Sender<ChatEvent>,
    in_flight: Mutex<Option<InFlightSend>>,
    default_model: String,
}

struct InFlightSend {
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Releases the in-flight marker when the send ends or its future is dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<Option<InFlightSend>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock_in_flight(self.in_flight).take();
    }
}

fn lock_in_flight(in_flight: &Mutex<Option<InFlightSend>>) -> MutexGuard<'_, Option<InFlightSend>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChatStore {
    pub fn new(backend: Arc<dyn ChatBackend>, default_model: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                backend,
                state: RwLock::new(ChatState::default()),
                events,
                in_flight: Mutex::new(None),
                default_model: default_model.into(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_sending(&self) -> bool {
        lock_in_flight(&self.inner.in_flight).is_some()
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let sending = self.is_sending();
        self.inner.state.read().await.snapshot(sending)
    }

    /// Reloads the session directory from the backend.
    pub async fn fetch_sessions(&self) -> SyncResult<Vec<SessionRecord>> {
        let sessions = self
            .inner
            .backend
            .list_sessions()
            .await
            .context(BackendSnafu {
                stage: "fetch-sessions",
            })?;

        self.inner
            .state
            .write()
            .await
            .directory
            .replace_all(sessions.clone());
        tracing::debug!(count = sessions.len(), "session directory refreshed");
        self.emit(ChatEvent::DirectoryChanged);
        Ok(sessions)
    }

    /// Creates a session and makes it the active, empty conversation.
    pub async fn create_session(&self, title: Option<&str>) -> SyncResult<SessionRecord> {
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(PLACEHOLDER_SESSION_TITLE);

        let session = self
            .inner
            .backend
            .create_session(title)
            .await
            .context(CreateSessionSnafu {
                stage: "create-session",
            })?;

        let generation = {
            let mut guard = self.inner.state.write().await;
            guard.directory.upsert_at_front(session.clone());
            guard.conversation.replace(session.clone(), Vec::new())
        };

        tracing::info!(session_id = %session.id, "session created");
        self.emit(ChatEvent::DirectoryChanged);
        self.emit(ChatEvent::TranscriptReplaced {
            session_id: session.id,
            generation,
        });
        Ok(session)
    }

    /// Switches the active conversation to `id`, loading its transcript.
    pub async fn load_session(&self, id: SessionId) -> SyncResult<SessionRecord> {
        let SessionDetail { session, messages } = self
            .inner
            .backend
            .get_session(id)
            .await
            .context(BackendSnafu {
                stage: "load-session",
            })?;

        let transcript = messages.into_iter().map(Message::from).collect::<Vec<_>>();
        let (generation, renamed) = {
            let mut guard = self.inner.state.write().await;
            let renamed = guard.directory.rename(session.id, &session.title);
            let generation = guard.conversation.replace(session.clone(), transcript);
            (generation, renamed)
        };

        tracing::debug!(session_id = %session.id, generation, "active conversation replaced");
        if renamed {
            self.emit(ChatEvent::DirectoryChanged);
        }
        self.emit(ChatEvent::TranscriptReplaced {
            session_id: session.id,
            generation,
        });
        Ok(session)
    }

    /// Sends one prompt and streams the reply into the active conversation.
    ///
    /// Only one send runs at a time; a second call fails with `SendInFlight`.
    pub async fn send_message(&self, request: SendRequest) -> SyncResult<SendOutcome> {
        ensure!(
            !request.is_empty(),
            EmptyMessageSnafu {
                stage: "send-message",
            }
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let _in_flight = self.begin_send(cancel_tx)?;

        let reconciler = StreamReconciler {
            backend: self.inner.backend.as_ref(),
            state: &self.inner.state,
            events: &self.inner.events,
            default_model: &self.inner.default_model,
        };
        reconciler.run(request, cancel_rx).await
    }

    fn begin_send(&self, cancel_tx: oneshot::Sender<()>) -> SyncResult<InFlightGuard<'_>> {
        let mut in_flight = lock_in_flight(&self.inner.in_flight);
        ensure!(
            in_flight.is_none(),
            SendInFlightSnafu {
                stage: "begin-send",
            }
        );
        *in_flight = Some(InFlightSend {
            cancel_tx: Some(cancel_tx),
        });
        Ok(InFlightGuard {
            in_flight: &self.inner.in_flight,
        })
    }

    /// Stops the in-flight send, keeping whatever was streamed so far.
    ///
    /// Returns `false` when nothing was streaming.
    pub fn cancel_send(&self) -> bool {
        lock_in_flight(&self.inner.in_flight)
            .as_mut()
            .and_then(|in_flight| in_flight.cancel_tx.take())
            .map(|cancel_tx| cancel_tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub async fn rename_session(&self, id: SessionId, title: &str) -> SyncResult<SessionRecord> {
        let title = title.trim();
        ensure!(
            !title.is_empty(),
            EmptyTitleSnafu {
                stage: "rename-session",
            }
        );

        let session = self
            .inner
            .backend
            .rename_session(id, title)
            .await
            .context(BackendSnafu {
                stage: "rename-session",
            })?;
        self.apply_title(&session).await;
        Ok(session)
    }

    /// Asks the backend to title the session from its content.
    pub async fn generate_summary(&self, id: SessionId) -> SyncResult<SessionRecord> {
        let session = self
            .inner
            .backend
            .generate_summary(id)
            .await
            .context(BackendSnafu {
                stage: "generate-summary",
            })?;
        self.apply_title(&session).await;
        Ok(session)
    }

    /// Uploads a document; its extracted text can be sent as file context.
    pub async fn upload_file(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> SyncResult<ExtractedDocument> {
        let size = bytes.len();
        let uploaded = self
            .inner
            .backend
            .upload_file(filename, bytes)
            .await
            .context(BackendSnafu {
                stage: "upload-file",
            })?;

        match uploaded.result {
            UploadResult::Extracted(document) => {
                tracing::info!(filename = %uploaded.filename, size, "document uploaded");
                Ok(document)
            }
            UploadResult::Rejected { error } => {
                tracing::warn!(filename = %uploaded.filename, reason = %error, "document rejected");
                UploadRejectedSnafu {
                    stage: "upload-file",
                    filename: uploaded.filename,
                    reason: error,
                }
                .fail()
            }
        }
    }

    async fn apply_title(&self, session: &SessionRecord) -> TitleOutcome {
        let outcome = {
            let mut guard = self.inner.state.write().await;
            propagate_title(&mut guard, session.id, &session.title)
        };
        if let Some(title) = outcome.updated_title() {
            tracing::info!(session_id = %session.id, title = %title, "session title updated");
            self.emit(ChatEvent::TitleChanged {
                session_id: session.id,
                title: title.to_string(),
            });
        }
        outcome
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.inner.events.send(event);
    }
}
