use thiserror::Error;

/// Failures raised by a persistent store adapter.
///
/// The coordinator never propagates these to callers of session or ledger operations;
/// they are logged and surfaced as a degraded write instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on key {key}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Redis error: {message}")]
    Redis {
        message: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("Invalid store key: {0}")]
    InvalidKey(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { key: key.into(), source }
    }

    pub fn redis(message: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            message: message.into(),
            source,
        }
    }

    pub fn db(message: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            message: message.into(),
            source,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::db("Database error", e)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::redis("Redis command failed", e)
    }
}
