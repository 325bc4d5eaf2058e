//! Error taxonomy of the lifecycle layer.
//!
//! None of these reach the client as a message. The connection logs them and
//! either drops the offending frame or, for transport failures, tears down.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::session::SessionError;
use crate::upload::UploadError;
use tessera_core::Cid;

/// Error type returned by application callbacks.
pub type CallbackResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("session rejected: {0}")]
    Session(#[from] SessionError),

    #[error("csrf token does not match session")]
    CsrfMismatch,

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("no view mounted at {0}")]
    UnknownRoute(String),

    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("unknown component handle {0}")]
    UnknownComponent(Cid),

    #[error("view is not joined")]
    NotJoined,

    #[error("view is already joined")]
    AlreadyJoined,

    #[error("callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),
}

impl LiveError {
    /// True for failures raised inside application code.
    pub fn is_callback(&self) -> bool {
        matches!(self, LiveError::Callback(_))
    }
}
