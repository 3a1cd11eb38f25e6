use snafu::ResultExt;
use tern_backend::{ChatBackend, FragmentPayload, FragmentStreamHandle};
use tern_protocol::{OutgoingMessage, PLACEHOLDER_SESSION_TITLE, SessionId};
use tokio::sync::{RwLock, broadcast, oneshot};

use super::error::{CreateSessionSnafu, SyncResult};
use super::events::ChatEvent;
use super::message::{MessageStatus, TranscriptSlot};
use super::state::{ChatState, ensure_session};
use super::title::{TitleOutcome, reconcile_title};

/// Appended to the placeholder when the stream fails.
pub const ERROR_MARKER: &str = "\n[Error generating response]";
pub const DOCUMENT_CONTEXT_SUFFIX: &str = "\n\n[Attached Document Context]";

/// One prompt as the user submitted it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub content: String,
    /// Falls back to the store's default model.
    pub model: Option<String>,
    pub images: Vec<String>,
    pub file_context: Option<String>,
}

impl SendRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_file_context(mut self, file_context: impl Into<String>) -> Self {
        self.file_context = Some(file_context.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.images.is_empty() && self.file_context.is_none()
    }
}

/// Text shown for the optimistic user entry.
///
/// Attachments are rendered as suffixes; the backend still receives them as
/// separate fields.
pub fn display_content(request: &SendRequest) -> String {
    let mut content = request.content.clone();
    if request.file_context.is_some() {
        content.push_str(DOCUMENT_CONTEXT_SUFFIX);
    }
    for (index, image) in request.images.iter().enumerate() {
        content.push_str(&format!("\n\n![Image {}]({image})", index + 1));
    }
    content
}

/// How a send ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    Completed,
    Failed { reason: String },
    Cancelled,
    /// The transcript was replaced before the send could finish writing.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub session_id: SessionId,
    /// `None` when the send was abandoned before anything was inserted.
    pub slot: Option<TranscriptSlot>,
    pub state: SendState,
    pub title: TitleOutcome,
}

enum StreamEnd {
    Completed,
    Failed(String),
    Cancelled,
}

/// Drives one send from session creation to title reconciliation.
pub(crate) struct StreamReconciler<'a> {
    pub(crate) backend: &'a dyn ChatBackend,
    pub(crate) state: &'a RwLock<ChatState>,
    pub(crate) events: &'a broadcast::Sender<ChatEvent>,
    pub(crate) default_model: &'a str,
}

impl StreamReconciler<'_> {
    pub(crate) async fn run(
        &self,
        request: SendRequest,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> SyncResult<SendOutcome> {
        let backend = self.backend;
        let ensured = ensure_session(self.state, move || async move {
            backend
                .create_session(PLACEHOLDER_SESSION_TITLE)
                .await
                .context(CreateSessionSnafu {
                    stage: "ensure-session",
                })
        })
        .await
        .inspect_err(|error| {
            tracing::error!(error = %error, "could not create a session to send into");
        })?;

        let session_id = ensured.session.id;
        if ensured.created {
            tracing::info!(session_id = %session_id, "created session for first message");
            self.emit(ChatEvent::DirectoryChanged);
            let generation = {
                let guard = self.state.read().await;
                (guard.conversation.session_id() == Some(session_id))
                    .then(|| guard.conversation.generation())
            };
            if let Some(generation) = generation {
                self.emit(ChatEvent::TranscriptReplaced {
                    session_id,
                    generation,
                });
            }
        }

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.to_string());

        let inserted = {
            let mut guard = self.state.write().await;
            if guard.conversation.session_id() == Some(session_id) {
                let moved = guard.directory.promote(session_id);
                guard
                    .conversation
                    .append_user_placeholder(display_content(&request));
                let slot = guard.conversation.append_assistant_placeholder(model.clone());
                Some((slot, moved))
            } else {
                None
            }
        };

        let Some((slot, moved)) = inserted else {
            tracing::debug!(
                session_id = %session_id,
                "active session changed before the message was inserted"
            );
            return Ok(self.finish(session_id, None, SendState::Abandoned, TitleOutcome::NotAttempted));
        };

        if moved {
            self.emit(ChatEvent::DirectoryChanged);
        }
        self.emit(ChatEvent::SendStarted { session_id, slot });

        let outgoing = OutgoingMessage {
            content: request.content,
            model,
            images: request.images,
            file_context: request.file_context,
        };
        let (end, mut stale) = self.stream_into(session_id, slot, outgoing, &mut cancel_rx).await;

        let terminal = {
            let mut guard = self.state.write().await;
            let conversation = &mut guard.conversation;
            match &end {
                StreamEnd::Completed => conversation.finish(slot, MessageStatus::Done),
                StreamEnd::Failed(_) => conversation
                    .append_to_index(slot, ERROR_MARKER)
                    .and_then(|()| conversation.finish(slot, MessageStatus::Failed)),
                StreamEnd::Cancelled => conversation.finish(slot, MessageStatus::Cancelled),
            }
        };
        if let Err(error) = terminal {
            tracing::debug!(session_id = %session_id, error = %error, "terminal write skipped");
            stale = true;
        } else if matches!(end, StreamEnd::Failed(_)) {
            self.emit(ChatEvent::FragmentApplied {
                slot,
                text: ERROR_MARKER.to_string(),
            });
        }

        let title = match end {
            StreamEnd::Completed => self.reconcile_title(session_id).await,
            StreamEnd::Failed(_) | StreamEnd::Cancelled => TitleOutcome::NotAttempted,
        };

        let state = match end {
            _ if stale => SendState::Abandoned,
            StreamEnd::Completed => SendState::Completed,
            StreamEnd::Failed(reason) => SendState::Failed { reason },
            StreamEnd::Cancelled => SendState::Cancelled,
        };

        Ok(self.finish(session_id, Some(slot), state, title))
    }

    async fn stream_into(
        &self,
        session_id: SessionId,
        slot: TranscriptSlot,
        outgoing: OutgoingMessage,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> (StreamEnd, bool) {
        let FragmentStreamHandle { mut stream, worker } =
            match self.backend.stream_message(session_id, outgoing) {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::warn!(session_id = %session_id, error = %error, "failed to start message stream");
                    return (StreamEnd::Failed(error.to_string()), false);
                }
            };
        tokio::spawn(worker);
        tracing::debug!(session_id = %session_id, generation = slot.generation, "message stream opened");

        let mut stale = false;
        let mut cancel_armed = true;

        let end = loop {
            let event = tokio::select! {
                biased;
                cancelled = &mut *cancel_rx, if cancel_armed => {
                    match cancelled {
                        Ok(()) => {
                            stream.cancel();
                            break StreamEnd::Cancelled;
                        }
                        Err(_) => {
                            cancel_armed = false;
                            continue;
                        }
                    }
                }
                event = stream.recv() => event,
            };

            let Some(event) = event else {
                break StreamEnd::Failed("stream closed before a terminal event".to_string());
            };

            match event.payload {
                FragmentPayload::Fragment(text) => {
                    if stale {
                        continue;
                    }
                    let applied = self
                        .state
                        .write()
                        .await
                        .conversation
                        .append_to_index(slot, &text);
                    match applied {
                        Ok(()) => self.emit(ChatEvent::FragmentApplied { slot, text }),
                        Err(error) => {
                            // Keep draining so the stream ends on its own terms.
                            tracing::debug!(
                                session_id = %session_id,
                                error = %error,
                                "stream target went stale"
                            );
                            stale = true;
                        }
                    }
                }
                FragmentPayload::Done => break StreamEnd::Completed,
                FragmentPayload::Error(reason) => break StreamEnd::Failed(reason),
            }
        };

        match &end {
            StreamEnd::Completed => {
                tracing::debug!(session_id = %session_id, "message stream completed");
            }
            StreamEnd::Failed(reason) => {
                tracing::warn!(session_id = %session_id, reason = %reason, "message stream failed");
            }
            StreamEnd::Cancelled => {
                tracing::debug!(session_id = %session_id, "message stream cancelled");
            }
        }

        (end, stale)
    }

    async fn reconcile_title(&self, session_id: SessionId) -> TitleOutcome {
        let detail = match self.backend.get_session(session_id).await {
            Ok(detail) => detail,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to refresh session after reply; keeping titles"
                );
                return TitleOutcome::FetchFailed;
            }
        };

        let outcome = {
            let mut guard = self.state.write().await;
            reconcile_title(&mut guard, session_id, &detail.session.title)
        };

        if let Some(title) = outcome.updated_title() {
            tracing::info!(session_id = %session_id, title = %title, "session title updated");
            self.emit(ChatEvent::TitleChanged {
                session_id,
                title: title.to_string(),
            });
        }
        outcome
    }

    fn finish(
        &self,
        session_id: SessionId,
        slot: Option<TranscriptSlot>,
        state: SendState,
        title: TitleOutcome,
    ) -> SendOutcome {
        self.emit(ChatEvent::SendFinished {
            session_id,
            slot,
            state: state.clone(),
        });
        SendOutcome {
            session_id,
            slot,
            state,
            title,
        }
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
