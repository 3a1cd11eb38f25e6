pub mod error;
pub mod ids;
pub mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use ids::{MessageId, SessionId};
pub use types::{
    DEFAULT_MODEL, ExtractedDocument, ExtractedImage, MessageRecord, MessageRole, NewSession,
    OutgoingMessage, PLACEHOLDER_SESSION_TITLE, SessionDetail, SessionPatch, SessionRecord,
    UploadResult, UploadedFile, parse_timestamp,
};
