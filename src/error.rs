//! Error type shared by storage, artifact handling and the HTTP layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid artifact path {path:?}: {reason}")]
    InvalidArtifactPath { path: String, reason: &'static str },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Maximum nesting level ({max}) exceeded: parent run is at level {parent_level}")]
    NestingLimitExceeded { parent_level: i64, max: i64 },

    #[error("Artifact path {path:?} conflicts with existing artifact {existing:?}")]
    ArtifactPathConflict { path: String, existing: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status code this error is reported with
    pub fn status(&self) -> u16 {
        match self {
            Error::InvalidArtifactPath { .. }
            | Error::Validation(_)
            | Error::UnsupportedScheme(_)
            | Error::NestingLimitExceeded { .. } => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::ArtifactPathConflict { .. } => 409,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => 404,
            Error::Io(_) | Error::Database(_) | Error::Json(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == 404
    }
}

pub type Result<T> = std::result::Result<T, Error>;
