//! Error taxonomy for the capture pipeline
//!
//! Failures are contained per unit: a bind failure names its port, a geo
//! failure degrades that one event to Unknown, a transport failure removes
//! only the owning subscriber.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geo lookup timed out")]
    Timeout,

    #[error("geo lookup rate limit queue is full")]
    RateLimited,

    #[error("geo provider request failed: {0}")]
    Provider(String),

    #[error("malformed geo provider response: {0}")]
    Malformed(String),
}

impl GeoError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GeoError::Timeout
        } else if err.is_decode() {
            GeoError::Malformed(err.to_string())
        } else {
            GeoError::Provider(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Worth retrying: busy/locked database, pool exhaustion, I/O hiccups.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => StoreError::Transient(err.to_string()),
            sqlx::Error::Database(db) => {
                let message = db.message().to_lowercase();
                if message.contains("locked") || message.contains("busy") {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Permanent(err.to_string())
                }
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("subscriber channel closed: {0}")]
    Closed(String),
}
