use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("store is closed")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] fsdoc_store::StoreError),

    #[error("index error: {0}")]
    Index(#[from] fsdoc_index::IndexError),

    #[error("session error: {0}")]
    Session(#[from] fsdoc_session::SessionError),
}

pub type SdkResult<T> = Result<T, SdkError>;
