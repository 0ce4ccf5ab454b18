//! Error types for hookq.
//!
//! Delivery failures are not errors: a [`Sender`](crate::sender::Sender)
//! reports them as [`DeliveryOutcome`](crate::model::DeliveryOutcome) values.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    /// The caller's lease token does not match the item's current lease.
    #[error("lease mismatch for work item {id}")]
    LeaseMismatch { id: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Backend unavailable or failing. Retried by the dispatch loop, fatal
    /// after repeated failure.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Database(_))
    }

    pub fn is_lease_mismatch(&self) -> bool {
        matches!(self, Error::LeaseMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
