use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtqError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0}")]
    Timeout(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("store rejected request with status {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OtqError {
    /// Cancelled requests were superseded or shut down; their results are
    /// discarded without being reported.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, OtqError>;
