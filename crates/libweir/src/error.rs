use thiserror::Error;
use weir_protocol::{ErrorCode, SessionId};

#[derive(Error, Debug)]
pub enum WeirError {
    #[error("stream not found: {0}")]
    StreamNotFound(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
}

impl WeirError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            WeirError::StreamNotFound(_) => (ErrorCode::StreamNotFound, self.to_string()),
            WeirError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
        }
    }
}
