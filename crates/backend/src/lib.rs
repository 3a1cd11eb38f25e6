use std::sync::Arc;

mod client;
mod credential;
mod decode;
mod http;

pub use client::{
    BackendConfig, BackendError, BackendResult, BoxFuture, ChatBackend, FragmentEvent,
    FragmentPayload, FragmentStream, FragmentStreamHandle, FragmentWorker, fragment_channel,
};
pub use credential::CredentialSource;
pub use decode::Utf8FragmentDecoder;
pub use http::{DEFAULT_BASE_URL, HttpBackend};

pub fn create_backend(config: BackendConfig) -> BackendResult<Arc<dyn ChatBackend>> {
    Ok(Arc::new(HttpBackend::new(config)?))
}
