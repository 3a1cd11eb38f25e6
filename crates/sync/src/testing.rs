use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use tern_backend::{
    BackendError, BackendResult, BoxFuture, ChatBackend, FragmentEvent, FragmentPayload,
    FragmentStreamHandle, fragment_channel,
};
use tern_protocol::{
    ExtractedDocument, MessageRecord, MessageRole, OutgoingMessage, SessionDetail, SessionId,
    SessionRecord, UploadedFile,
};
use tokio::sync::{mpsc, oneshot};

/// A stream opened against `ScriptedBackend` that the test drives by hand.
pub(crate) struct OpenedStream {
    pub session_id: SessionId,
    pub events: mpsc::UnboundedSender<FragmentEvent>,
    pub cancel_rx: oneshot::Receiver<()>,
}

impl OpenedStream {
    pub fn push(&self, payload: FragmentPayload) {
        let _ = self.events.send(FragmentEvent {
            session_id: self.session_id,
            payload,
        });
    }

    pub fn fragment(&self, text: &str) {
        self.push(FragmentPayload::Fragment(text.to_string()));
    }

    pub fn done(&self) {
        self.push(FragmentPayload::Done);
    }
}

/// In-memory backend whose replies are scripted up front or driven through a channel.
pub(crate) struct ScriptedBackend {
    sessions: Mutex<Vec<SessionDetail>>,
    next_id: AtomicU64,
    replies: Mutex<VecDeque<Vec<FragmentPayload>>>,
    opened_tx: Mutex<Option<mpsc::UnboundedSender<OpenedStream>>>,
    create_gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    fail_create: AtomicBool,
    fail_refresh: AtomicBool,
    fail_stream_open: AtomicBool,
    refresh_calls: AtomicUsize,
    sent: Mutex<Vec<OutgoingMessage>>,
}

pub(crate) fn reply(fragments: &[&str]) -> Vec<FragmentPayload> {
    fragments
        .iter()
        .map(|text| FragmentPayload::Fragment(text.to_string()))
        .chain(std::iter::once(FragmentPayload::Done))
        .collect()
}

fn not_found(stage: &'static str) -> BackendError {
    BackendError::Status {
        stage,
        status: 404,
        body: "{\"detail\":\"Session not found\"}".to_string(),
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(100),
            replies: Mutex::new(VecDeque::new()),
            opened_tx: Mutex::new(None),
            create_gate: Mutex::new(None),
            fail_create: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
            fail_stream_open: AtomicBool::new(false),
            refresh_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Seeds sessions in list order.
    pub fn with_sessions(self, sessions: &[(u64, &str)]) -> Self {
        *self.sessions.lock().unwrap() = sessions
            .iter()
            .map(|(id, title)| SessionDetail {
                session: SessionRecord::new(SessionId::new(*id), *title, Utc::now()),
                messages: Vec::new(),
            })
            .collect();
        self
    }

    pub fn with_history(self, id: u64, contents: &[&str]) -> Self {
        {
            let mut sessions = self.sessions.lock().unwrap();
            let detail = sessions
                .iter_mut()
                .find(|detail| detail.session.id == SessionId::new(id))
                .unwrap();
            detail.messages = contents
                .iter()
                .enumerate()
                .map(|(index, content)| MessageRecord {
                    id: None,
                    role: if index % 2 == 0 {
                        MessageRole::User
                    } else {
                        MessageRole::Assistant
                    },
                    content: content.to_string(),
                    created_at: Utc::now(),
                    model: None,
                })
                .collect();
        }
        self
    }

    pub fn script_reply(&self, payloads: Vec<FragmentPayload>) {
        self.replies.lock().unwrap().push_back(payloads);
    }

    /// Hands every unscripted stream to the returned receiver.
    pub fn manual_streams(&self) -> mpsc::UnboundedReceiver<OpenedStream> {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        *self.opened_tx.lock().unwrap() = Some(opened_tx);
        opened_rx
    }

    /// Changes the title the backend reports, as its own title generation would.
    pub fn set_title(&self, id: u64, title: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(detail) = sessions
            .iter_mut()
            .find(|detail| detail.session.id == SessionId::new(id))
        {
            detail.session.title = title.to_string();
        }
    }

    /// Parks the next `create_session` call until the returned sender fires.
    ///
    /// The receiver resolves once the call has started.
    pub fn hold_create(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.create_gate.lock().unwrap() = Some((started_tx, release_rx));
        (started_rx, release_tx)
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self) {
        self.fail_refresh.store(true, Ordering::SeqCst);
    }

    /// Makes `stream_message` fail before a stream exists, as an unreadable token would.
    pub fn fail_stream_open(&self) {
        self.fail_stream_open.store(true, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn find(&self, id: SessionId) -> Option<SessionDetail> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|detail| detail.session.id == id)
            .cloned()
    }
}

impl ChatBackend for ScriptedBackend {
    fn create_session<'a>(&'a self, title: &'a str) -> BoxFuture<'a, BackendResult<SessionRecord>> {
        Box::pin(async move {
            let gate = self.create_gate.lock().unwrap().take();
            if let Some((started_tx, release_rx)) = gate {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            }
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(BackendError::Status {
                    stage: "create-session",
                    status: 500,
                    body: "database unavailable".to_string(),
                });
            }
            let id = SessionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            let session = SessionRecord::new(id, title, Utc::now());
            self.sessions.lock().unwrap().insert(
                0,
                SessionDetail {
                    session: session.clone(),
                    messages: Vec::new(),
                },
            );
            Ok(session)
        })
    }

    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .map(|detail| detail.session.clone())
                .collect())
        })
    }

    fn get_session<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, BackendResult<SessionDetail>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_refresh.load(Ordering::SeqCst) {
                return Err(BackendError::Status {
                    stage: "get-session",
                    status: 503,
                    body: String::new(),
                });
            }
            self.find(session_id).ok_or_else(|| not_found("get-session"))
        })
    }

    fn rename_session<'a>(
        &'a self,
        session_id: SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionRecord>> {
        Box::pin(async move {
            self.set_title(session_id.get(), title);
            self.find(session_id)
                .map(|detail| detail.session)
                .ok_or_else(|| not_found("rename-session"))
        })
    }

    fn generate_summary<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, BackendResult<SessionRecord>> {
        Box::pin(async move {
            self.set_title(session_id.get(), "Summarized chat");
            self.find(session_id)
                .map(|detail| detail.session)
                .ok_or_else(|| not_found("generate-summary"))
        })
    }

    fn upload_file<'a>(
        &'a self,
        filename: &'a str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, BackendResult<UploadedFile>> {
        Box::pin(async move {
            if filename.ends_with(".zip") {
                return Ok(UploadedFile::rejected(filename, "Unsupported file format."));
            }
            Ok(UploadedFile::extracted(
                filename,
                ExtractedDocument {
                    text: String::from_utf8_lossy(&bytes).into_owned(),
                    images: Vec::new(),
                },
            ))
        })
    }

    fn stream_message(
        &self,
        session_id: SessionId,
        message: OutgoingMessage,
    ) -> BackendResult<FragmentStreamHandle> {
        if self.fail_stream_open.load(Ordering::SeqCst) {
            return Err(BackendError::ReadCredential {
                stage: "read-credential-file",
                path: "/run/secrets/token".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            });
        }
        self.sent.lock().unwrap().push(message);
        let (event_tx, stream, cancel_rx) = fragment_channel(session_id);

        let scripted = self.replies.lock().unwrap().pop_front();
        match scripted {
            Some(payloads) => {
                for payload in payloads {
                    let _ = event_tx.send(FragmentEvent {
                        session_id,
                        payload,
                    });
                }
            }
            None => {
                let opened_tx = self.opened_tx.lock().unwrap().clone();
                match opened_tx {
                    Some(opened_tx) => {
                        let _ = opened_tx.send(OpenedStream {
                            session_id,
                            events: event_tx,
                            cancel_rx,
                        });
                    }
                    None => {
                        let _ = event_tx.send(FragmentEvent {
                            session_id,
                            payload: FragmentPayload::Error("no scripted reply".to_string()),
                        });
                    }
                }
            }
        }

        Ok(FragmentStreamHandle {
            stream,
            worker: Box::pin(async {}),
        })
    }
}
