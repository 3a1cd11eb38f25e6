use std::path::PathBuf;

use snafu::ResultExt;

use super::client::{BackendResult, ReadCredentialSnafu};

/// Where the externally issued bearer token comes from.
///
/// The value is re-read for every request so a refreshed token is picked up
/// without restarting the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CredentialSource {
    #[default]
    Anonymous,
    Static(String),
    Env(String),
    File(PathBuf),
}

impl CredentialSource {
    pub fn bearer(&self) -> BackendResult<Option<String>> {
        let raw = match self {
            Self::Anonymous => return Ok(None),
            Self::Static(token) => token.clone(),
            Self::Env(name) => std::env::var(name).unwrap_or_default(),
            Self::File(path) => match std::fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "credential file missing; sending anonymously");
                    return Ok(None);
                }
                Err(source) => {
                    return Err(source).context(ReadCredentialSnafu {
                        stage: "read-credential-file",
                        path: path.clone(),
                    });
                }
            },
        };

        let token = raw.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
    }
}
