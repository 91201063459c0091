pub mod config;
pub mod credential_store;
pub mod effects;
pub mod error;
pub mod record_store;
pub mod sqlite_store;
pub mod storage;
