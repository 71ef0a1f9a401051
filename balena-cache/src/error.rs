use crate::remote::RemoteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Query syntax error: {0}")]
    QuerySyntax(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ambiguous match: {0}")]
    Ambiguous(String),

    #[error("Timed out waiting for refresh of {0}")]
    Timeout(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// Coarse classification of a [`CacheError`], for callers that only care
/// about where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    Remote,
    QuerySyntax,
    InvalidScope,
    NotFound,
    Timeout,
    Tunnel,
    Config,
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Storage(_)
            | CacheError::Sqlite(_)
            | CacheError::Io(_)
            | CacheError::Json(_) => ErrorKind::Storage,
            CacheError::Remote(_) => ErrorKind::Remote,
            CacheError::QuerySyntax(_) => ErrorKind::QuerySyntax,
            CacheError::InvalidScope(_) => ErrorKind::InvalidScope,
            CacheError::NotFound(_) | CacheError::Ambiguous(_) => ErrorKind::NotFound,
            CacheError::Timeout(_) => ErrorKind::Timeout,
            CacheError::Tunnel(_) => ErrorKind::Tunnel,
            CacheError::Config(_) | CacheError::Yaml(_) => ErrorKind::Config,
        }
    }

    pub fn is_storage(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }

    pub fn is_remote(&self) -> bool {
        self.kind() == ErrorKind::Remote
    }

    pub fn is_query_syntax(&self) -> bool {
        self.kind() == ErrorKind::QuerySyntax
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
