use common::api::FieldErrors;
use thiserror::Error;

/// Outcome of a single call against an instance API. Every remote operation
/// returns this instead of panicking or bubbling a raw transport error.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("instance unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("instance rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed response from instance: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0:?}")]
    Invalid(FieldErrors),

    #[error("patch must be a JSON object")]
    InvalidPatch,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DashboardError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid snapshot document: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DashboardError>;
