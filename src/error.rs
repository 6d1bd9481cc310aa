//! Error types for session pooling and sandbox reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for session and sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to construct a connection or session.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// A remote command failed or returned a nonzero exit code.
    #[error("command '{command}' failed (exit code {}): {message}", display_exit_code(.exit_code))]
    Command {
        command: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// A structural sandbox step (drop, create, configure) failed.
    #[error("sandbox operation failed at {path}: {reason}")]
    Sandbox { path: PathBuf, reason: String },

    /// Raw failure raised inside a transport implementation.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session has been terminated and cannot run commands.
    #[error("session has been terminated")]
    SessionTerminated,

    /// The pool has been shut down.
    #[error("session pool is shut down")]
    PoolClosed,

    /// Settings could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while reading or writing the change log.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

impl Error {
    /// Returns the remote exit code carried by a command error.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Command { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Returns true if this is a command-level failure.
    pub fn is_command(&self) -> bool {
        matches!(self, Error::Command { .. })
    }
}

/// Result type alias for session and sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
