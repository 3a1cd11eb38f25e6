use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use snafu::Snafu;
use tern_protocol::{OutgoingMessage, SessionDetail, SessionId, SessionRecord, UploadedFile};
use tokio::sync::{mpsc, oneshot};

use super::credential::CredentialSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub credential: CredentialSource,
    pub connect_timeout: Duration,
    /// Deadline for plain request/response calls. Streams are not bounded by it.
    pub request_timeout: Duration,
    pub session_page_size: u32,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, credential: CredentialSource) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            credential,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            session_page_size: 100,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_session_page_size(mut self, session_page_size: u32) -> Self {
        self.session_page_size = session_page_size;
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type FragmentWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("backend base url is empty"))]
    MissingBaseUrl { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to read bearer credential from {path:?}"))]
    ReadCredential {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("request failed on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode backend response on `{stage}`, {source}"))]
    DecodeBody {
        stage: &'static str,
        source: serde_json::Error,
    },
}

impl BackendError {
    /// HTTP status reported by the backend, if the failure came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One unit of streamed reply text, or the terminal signal of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentPayload {
    Fragment(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentEvent {
    pub session_id: SessionId,
    pub payload: FragmentPayload,
}

/// Receiving side of one streamed send.
///
/// Dropping it tells the worker to stop reading from the network.
pub struct FragmentStream {
    session_id: SessionId,
    events: mpsc::UnboundedReceiver<FragmentEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct FragmentStreamHandle {
    pub stream: FragmentStream,
    pub worker: FragmentWorker,
}

impl FragmentStream {
    pub(crate) fn new(
        session_id: SessionId,
        events: mpsc::UnboundedReceiver<FragmentEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            session_id,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn recv(&mut self) -> Option<FragmentEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Backend operations the client consumes.
pub trait ChatBackend: Send + Sync {
    fn create_session<'a>(&'a self, title: &'a str) -> BoxFuture<'a, BackendResult<SessionRecord>>;
    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<SessionRecord>>>;
    fn get_session<'a>(&'a self, session_id: SessionId)
    -> BoxFuture<'a, BackendResult<SessionDetail>>;
    fn rename_session<'a>(
        &'a self,
        session_id: SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionRecord>>;
    fn generate_summary<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, BackendResult<SessionRecord>>;
    fn upload_file<'a>(
        &'a self,
        filename: &'a str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, BackendResult<UploadedFile>>;
    /// Prepares a streamed send. Nothing touches the network until `worker` is polled.
    fn stream_message(
        &self,
        session_id: SessionId,
        message: OutgoingMessage,
    ) -> BackendResult<FragmentStreamHandle>;
}

pub fn fragment_channel(
    session_id: SessionId,
) -> (
    mpsc::UnboundedSender<FragmentEvent>,
    FragmentStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        FragmentStream::new(session_id, event_rx, cancel_tx),
        cancel_rx,
    )
}
