use crate::error::store_error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A session for {identity} is already active")]
    SessionAlreadyActive { identity: String },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Failed to read configuration: {message}")]
    Configuration {
        message: String,
        #[source]
        source: figment::Error,
    },
}

impl SessionError {
    pub fn configuration(message: impl Into<String>, source: figment::Error) -> Self {
        Self::Configuration {
            message: message.into(),
            source,
        }
    }
}

impl From<figment::Error> for SessionError {
    fn from(e: figment::Error) -> Self {
        SessionError::configuration("Failed to read configuration", e)
    }
}

impl From<toml::ser::Error> for SessionError {
    fn from(e: toml::ser::Error) -> Self {
        SessionError::InvalidConfiguration(format!("default configuration is not serializable: {e}"))
    }
}
