use crate::infrastructure::record_store::RecordKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },
    #[error("Malformed record: {0}")]
    Decode(String),
    #[error("Store failure: {0}")]
    StoreFailure(String),
    #[error("Credential error: {0}")]
    Credential(String),
}
