use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WrapperError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service {0} is not running")]
    NotFound(String),

    #[error("Failed to stop service with PID {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("oCIS server is already running")]
    AlreadyRunning,

    #[error("{0}")]
    ShutdownTimeout(String),

    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Service name not specified")]
    MissingServiceName,

    #[error("Failed to set up pseudo-terminal: {0}")]
    Pty(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl WrapperError {
    /// HTTP status reported to control API callers for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyRunning => StatusCode::CONFLICT,
            Self::MissingServiceName => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Spawn { .. }
            | Self::NotFound(_)
            | Self::Signal { .. }
            | Self::ShutdownTimeout(_)
            | Self::NotReady(_)
            | Self::Pty(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<nix::Error> for WrapperError {
    fn from(e: nix::Error) -> Self {
        WrapperError::Pty(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WrapperError>;
