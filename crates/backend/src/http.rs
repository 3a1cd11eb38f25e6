use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, ensure};
use tern_protocol::{
    NewSession, OutgoingMessage, SessionDetail, SessionId, SessionPatch, SessionRecord,
    UploadedFile,
};
use tokio::sync::{mpsc, oneshot};

use super::client::{
    BackendConfig, BackendError, BackendResult, BoxFuture, BuildClientSnafu, ChatBackend,
    DecodeBodySnafu, FragmentEvent, FragmentPayload, FragmentStreamHandle, FragmentWorker,
    MissingBaseUrlSnafu, StatusSnafu, TransportSnafu, fragment_channel,
};
use super::decode::Utf8FragmentDecoder;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";

/// `ChatBackend` over the backend's REST API.
pub struct HttpBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        ensure!(
            !config.base_url.trim().is_empty(),
            MissingBaseUrlSnafu {
                stage: "http-backend-new",
            }
        );

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, request: RequestBuilder) -> BackendResult<RequestBuilder> {
        Ok(match self.config.credential.bearer()? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn send_json<T>(&self, stage: &'static str, request: RequestBuilder) -> BackendResult<T>
    where
        T: DeserializeOwned,
    {
        let request = self.authorize(request)?.timeout(self.config.request_timeout);
        let response = request.send().await.context(TransportSnafu { stage })?;
        let response = ensure_success(stage, response).await?;
        let payload = response.text().await.context(TransportSnafu { stage })?;
        serde_json::from_str(&payload).context(DecodeBodySnafu { stage })
    }

    async fn run_stream_worker(
        session_id: SessionId,
        request: RequestBuilder,
        event_tx: mpsc::UnboundedSender<FragmentEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(session_id = %session_id, "stream cancelled before it opened");
                return;
            }
            opened = open_stream(request) => opened,
        };

        let mut response = match opened {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to open message stream"
                );
                emit(&event_tx, session_id, FragmentPayload::Error(error.to_string()));
                return;
            }
        };

        let mut decoder = Utf8FragmentDecoder::new();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Dropping the response closes the connection.
                    tracing::debug!(session_id = %session_id, "message stream cancelled");
                    return;
                }
                chunk = response.chunk() => {
                    match chunk {
                        Ok(Some(bytes)) => {
                            let text = decoder.push(&bytes);
                            if !text.is_empty()
                                && !emit(&event_tx, session_id, FragmentPayload::Fragment(text))
                            {
                                return;
                            }
                        }
                        Ok(None) => {
                            let tail = decoder.finish();
                            if !tail.is_empty() {
                                emit(&event_tx, session_id, FragmentPayload::Fragment(tail));
                            }
                            emit(&event_tx, session_id, FragmentPayload::Done);
                            return;
                        }
                        Err(source) => {
                            let error = BackendError::Transport {
                                stage: "read-stream-chunk",
                                source,
                            };
                            tracing::warn!(
                                session_id = %session_id,
                                error = %error,
                                "message stream failed mid-flight"
                            );
                            emit(&event_tx, session_id, FragmentPayload::Error(error.to_string()));
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn open_stream(request: RequestBuilder) -> BackendResult<Response> {
    let stage = "open-stream";
    let response = request.send().await.context(TransportSnafu { stage })?;
    ensure_success(stage, response).await
}

async fn ensure_success(stage: &'static str, response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    StatusSnafu {
        stage,
        status: status.as_u16(),
        body,
    }
    .fail()
}

fn emit(
    event_tx: &mpsc::UnboundedSender<FragmentEvent>,
    session_id: SessionId,
    payload: FragmentPayload,
) -> bool {
    event_tx
        .send(FragmentEvent {
            session_id,
            payload,
        })
        .is_ok()
}

impl ChatBackend for HttpBackend {
    fn create_session<'a>(&'a self, title: &'a str) -> BoxFuture<'a, BackendResult<SessionRecord>> {
        Box::pin(async move {
            let body = NewSession {
                title: title.to_string(),
            };
            let request = self.client.post(self.endpoint("chat/sessions")).json(&body);
            self.send_json("create-session", request).await
        })
    }

    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            let path = format!(
                "chat/sessions?skip=0&limit={}",
                self.config.session_page_size
            );
            let request = self.client.get(self.endpoint(&path));
            self.send_json("list-sessions", request).await
        })
    }

    fn get_session<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, BackendResult<SessionDetail>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.endpoint(&format!("chat/sessions/{session_id}")));
            self.send_json("get-session", request).await
        })
    }

    fn rename_session<'a>(
        &'a self,
        session_id: SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionRecord>> {
        Box::pin(async move {
            let body = SessionPatch {
                title: title.to_string(),
            };
            let request = self
                .client
                .patch(self.endpoint(&format!("chat/sessions/{session_id}")))
                .json(&body);
            self.send_json("rename-session", request).await
        })
    }

    fn generate_summary<'a>(
        &'a self,
        session_id: SessionId,
    ) -> BoxFuture<'a, BackendResult<SessionRecord>> {
        Box::pin(async move {
            let request = self
                .client
                .post(self.endpoint(&format!("chat/sessions/{session_id}/summary")));
            self.send_json("generate-summary", request).await
        })
    }

    fn upload_file<'a>(
        &'a self,
        filename: &'a str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, BackendResult<UploadedFile>> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
            let form = reqwest::multipart::Form::new().part("file", part);
            let request = self
                .client
                .post(self.endpoint("chat/upload"))
                .multipart(form);
            self.send_json("upload-file", request).await
        })
    }

    fn stream_message(
        &self,
        session_id: SessionId,
        message: OutgoingMessage,
    ) -> BackendResult<FragmentStreamHandle> {
        let request = self.authorize(
            self.client
                .post(self.endpoint(&format!("chat/sessions/{session_id}/messages")))
                .json(&message),
        )?;

        let (event_tx, stream, cancel_rx) = fragment_channel(session_id);
        let worker: FragmentWorker = Box::pin(Self::run_stream_worker(
            session_id, request, event_tx, cancel_rx,
        ));

        Ok(FragmentStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use axum::body::{Body, Bytes};
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use tern_protocol::{DEFAULT_MODEL, MessageRole, UploadResult};

    use super::*;
    use crate::CredentialSource;

    #[derive(Clone, Default)]
    struct Recorded {
        authorization: Arc<Mutex<Vec<String>>>,
        bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    fn record_auth(recorded: &Recorded, headers: &HeaderMap) {
        let value = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        recorded.authorization.lock().unwrap().push(value);
    }

    fn session_json(id: u64, title: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "title": title,
            "user_id": 1,
            "created_at": "2024-05-01T10:00:00",
            "updated_at": "2024-05-01T10:00:00",
            "messages": []
        })
    }

    fn router(recorded: Recorded) -> Router {
        Router::new()
            .route(
                "/api/v1/chat/sessions",
                get(
                    |State(recorded): State<Recorded>, headers: HeaderMap| async move {
                        record_auth(&recorded, &headers);
                        Json(serde_json::json!([
                            session_json(2, "Second"),
                            session_json(1, "New Chat")
                        ]))
                    },
                )
                .post(
                    |State(recorded): State<Recorded>,
                     headers: HeaderMap,
                     Json(body): Json<serde_json::Value>| async move {
                        record_auth(&recorded, &headers);
                        let title = body["title"].as_str().unwrap_or_default().to_string();
                        recorded.bodies.lock().unwrap().push(body);
                        Json(session_json(7, &title))
                    },
                ),
            )
            .route(
                "/api/v1/chat/sessions/{id}",
                get(|Path(id): Path<u64>| async move {
                    if id == 404 {
                        return (
                            StatusCode::NOT_FOUND,
                            Json(serde_json::json!({"detail": "Session not found"})),
                        )
                            .into_response();
                    }
                    let mut detail = session_json(id, "Greeting");
                    detail["messages"] = serde_json::json!([
                        {"id": 1, "role": "user", "content": "hi", "session_id": id,
                         "created_at": "2024-05-01T10:00:01"},
                        {"id": 2, "role": "assistant", "content": "hello", "session_id": id,
                         "created_at": "2024-05-01T10:00:02"}
                    ]);
                    Json(detail).into_response()
                })
                .patch(
                    |Path(id): Path<u64>, Json(body): Json<serde_json::Value>| async move {
                        Json(session_json(id, body["title"].as_str().unwrap_or_default()))
                    },
                ),
            )
            .route(
                "/api/v1/chat/sessions/{id}/summary",
                post(|Path(id): Path<u64>| async move { Json(session_json(id, "Summed up")) }),
            )
            .route(
                "/api/v1/chat/sessions/{id}/messages",
                post(
                    |State(recorded): State<Recorded>,
                     Path(id): Path<u64>,
                     headers: HeaderMap,
                     Json(body): Json<serde_json::Value>| async move {
                        record_auth(&recorded, &headers);
                        recorded.bodies.lock().unwrap().push(body);
                        if id == 500 {
                            return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
                        }
                        // The euro sign is split across two network chunks.
                        let euro = "\u{20ac}".as_bytes();
                        let chunks = vec![
                            Ok::<_, std::io::Error>(Bytes::from_static(b"Hel")),
                            Ok(Bytes::from_static(b"lo, ")),
                            Ok(Bytes::from(vec![b'w', euro[0]])),
                            Ok(Bytes::from(vec![euro[1], euro[2]])),
                            Ok(Bytes::from_static(b"rld")),
                        ];
                        Body::from_stream(futures::stream::iter(chunks)).into_response()
                    },
                ),
            )
            .route(
                "/api/v1/chat/upload",
                post(|| async {
                    Json(serde_json::json!({
                        "filename": "notes.txt",
                        "result": {"text": "extracted text", "images": []}
                    }))
                }),
            )
            .with_state(recorded)
    }

    async fn spawn_backend(recorded: Recorded) -> String {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = router(recorded);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/api/v1")
    }

    fn backend(base_url: String) -> HttpBackend {
        HttpBackend::new(BackendConfig::new(
            base_url,
            CredentialSource::Static("secret".to_string()),
        ))
        .expect("backend")
    }

    async fn collect(handle: FragmentStreamHandle) -> Vec<FragmentPayload> {
        let FragmentStreamHandle { mut stream, worker } = handle;
        tokio::spawn(worker);
        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            payloads.push(event.payload);
        }
        payloads
    }

    fn outgoing(content: &str) -> OutgoingMessage {
        OutgoingMessage {
            content: content.to_string(),
            model: DEFAULT_MODEL.to_string(),
            images: vec!["https://img.example/cat.png".to_string()],
            file_context: Some("doc".to_string()),
        }
    }

    #[test]
    fn rejects_empty_base_url() {
        let result = HttpBackend::new(BackendConfig::new("  ", CredentialSource::Anonymous));
        assert!(matches!(result, Err(BackendError::MissingBaseUrl { .. })));
    }

    #[test]
    fn joins_endpoints_without_double_slashes() {
        let backend = backend("http://localhost:8000/api/v1/".to_string());
        assert_eq!(
            backend.endpoint("/chat/sessions"),
            "http://localhost:8000/api/v1/chat/sessions"
        );
    }

    #[tokio::test]
    async fn lists_sessions_with_bearer_credential() {
        let recorded = Recorded::default();
        let backend = backend(spawn_backend(recorded.clone()).await);

        let sessions = backend.list_sessions().await.unwrap();
        assert_eq!(
            sessions.iter().map(|s| s.id.get()).collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert_eq!(
            recorded.authorization.lock().unwrap().as_slice(),
            ["Bearer secret"]
        );
    }

    #[tokio::test]
    async fn creates_session_with_requested_title() {
        let recorded = Recorded::default();
        let backend = backend(spawn_backend(recorded.clone()).await);

        let session = backend.create_session("New Chat").await.unwrap();
        assert_eq!(session.id, SessionId::new(7));
        assert!(session.has_placeholder_title());
        assert_eq!(
            recorded.bodies.lock().unwrap()[0],
            serde_json::json!({"title": "New Chat"})
        );
    }

    #[tokio::test]
    async fn fetches_session_detail_and_maps_missing_sessions_to_status() {
        let backend = backend(spawn_backend(Recorded::default()).await);

        let detail = backend.get_session(SessionId::new(3)).await.unwrap();
        assert_eq!(detail.session.title, "Greeting");
        assert_eq!(detail.messages[1].role, MessageRole::Assistant);

        let error = backend.get_session(SessionId::new(404)).await.unwrap_err();
        assert_eq!(error.status(), Some(404));
    }

    #[tokio::test]
    async fn rename_and_summary_return_backend_titles() {
        let backend = backend(spawn_backend(Recorded::default()).await);

        let renamed = backend
            .rename_session(SessionId::new(3), "Renamed")
            .await
            .unwrap();
        assert_eq!(renamed.title, "Renamed");

        let summarized = backend.generate_summary(SessionId::new(3)).await.unwrap();
        assert_eq!(summarized.title, "Summed up");
    }

    #[tokio::test]
    async fn uploads_file_and_returns_extracted_text() {
        let backend = backend(spawn_backend(Recorded::default()).await);
        let uploaded = backend
            .upload_file("notes.txt", b"hello".to_vec())
            .await
            .unwrap();
        match uploaded.result {
            UploadResult::Extracted(document) => assert_eq!(document.text, "extracted text"),
            UploadResult::Rejected { error } => panic!("upload rejected: {error}"),
        }
    }

    #[tokio::test]
    async fn streams_fragments_in_order_and_repairs_split_characters() {
        let recorded = Recorded::default();
        let backend = backend(spawn_backend(recorded.clone()).await);

        let handle = backend
            .stream_message(SessionId::new(3), outgoing("hi"))
            .unwrap();
        let payloads = collect(handle).await;

        assert_eq!(payloads.last(), Some(&FragmentPayload::Done));
        let text = payloads
            .iter()
            .filter_map(|payload| match payload {
                FragmentPayload::Fragment(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        assert_eq!(text, "Hello, w\u{20ac}rld");

        let body = recorded.bodies.lock().unwrap()[0].clone();
        assert_eq!(body["content"], "hi");
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["file_context"], "doc");
        assert_eq!(body["images"][0], "https://img.example/cat.png");
        assert_eq!(
            recorded.authorization.lock().unwrap().as_slice(),
            ["Bearer secret"]
        );
    }

    #[tokio::test]
    async fn stream_open_failure_is_reported_as_error_event() {
        let backend = backend(spawn_backend(Recorded::default()).await);

        let handle = backend
            .stream_message(SessionId::new(500), outgoing("hi"))
            .unwrap();
        let payloads = collect(handle).await;

        assert_eq!(payloads.len(), 1);
        match &payloads[0] {
            FragmentPayload::Error(message) => assert!(message.contains("500")),
            other => panic!("expected error payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_backend_fails_the_stream() {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let backend = backend(format!("http://{addr}/api/v1"));
        let handle = backend
            .stream_message(SessionId::new(1), outgoing("hi"))
            .unwrap();
        let payloads = collect(handle).await;

        assert!(matches!(payloads.as_slice(), [FragmentPayload::Error(_)]));
    }
}
