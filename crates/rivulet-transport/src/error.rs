//! Transport error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bus is closed")]
    Closed,

    #[error("Request to {subject} timed out")]
    RequestTimeout { subject: String },

    #[error("Send to {subject} failed: {reason}")]
    SendFailed { subject: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
