use thiserror::Error;
use tokio::time::Duration;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("poll timed out after {0:?}")]
    Timeout(Duration),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("address error: {0}")]
    AddressError(String),
    #[error("execution error: {0}")]
    ExecutionError(String),
    #[error("broker connection error: {0}")]
    BrokerError(String),
}

impl From<rumqttc::ClientError> for DriverError {
    fn from(e: rumqttc::ClientError) -> Self {
        DriverError::BrokerError(e.to_string())
    }
}
