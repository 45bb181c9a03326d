use anyhow::Error as AnyhowError;
use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use thiserror::Error;
use tokio::{task::JoinError, time::Duration};

pub type EdgeResult<T, E = EdgeError> = Result<T, E>;

#[derive(Error, Debug, Default)]
pub enum EdgeError {
    #[error("service unavailable")]
    #[default]
    ServiceUnavailable,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    JoinError(#[from] JoinError),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("authentication failure: {0}")]
    AuthenticationError(String),
    #[error("authorization failure: {0}")]
    AuthorizationError(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("initialization error: {0}")]
    InitializationError(String),
    #[error("shutdown error: {0}")]
    ShutdownError(String),
    #[error("invalid state: {0}")]
    InvalidStateError(String),
}

impl From<String> for EdgeError {
    #[inline]
    fn from(e: String) -> Self {
        EdgeError::Msg(e)
    }
}

impl From<&str> for EdgeError {
    #[inline]
    fn from(e: &str) -> Self {
        EdgeError::Msg(e.to_string())
    }
}
