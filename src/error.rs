use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Session not found for ID: {0}")]
    SessionNotFound(String),

    #[error("Session is no longer active: {0}")]
    SessionInactive(String),

    #[error("Failed to spawn shell '{shell}': {source}")]
    SpawnFailure {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Write to shell stdin failed: {0}")]
    WriteFailure(String),

    #[error("No such file or directory: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

impl AppError {
    /// Errors raised by `cd` validation. These are reported on the session's
    /// error stream instead of failing the command.
    pub fn is_path_validation(&self) -> bool {
        matches!(
            self,
            AppError::PathNotFound(_) | AppError::NotADirectory(_) | AppError::InvalidPath(_)
        )
    }
}
