//! Error types for sb
//!
//! All modules use `SbResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sb operations
pub type SbResult<T> = Result<T, SbError>;

/// All errors that can occur in sb
#[derive(Error, Debug)]
pub enum SbError {
    // Resolution errors
    #[error("Could not locate binary: {0}")]
    BinaryNotFound(String),

    // External tool errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with status {status}: {command}: {stderr}")]
    ToolFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Command timed out after {secs}s: {command}")]
    ToolTimeout { command: String, secs: u64 },

    #[error("Sandbox exited with code {0}")]
    SandboxExit(i32),

    // Store errors
    #[error("Failed to lock object store at {path}: {reason}")]
    StoreLock { path: PathBuf, reason: String },

    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // Task errors
    #[error("Background task failed: {0}")]
    Task(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl SbError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Whether the failure is local to a single resolved entity.
    ///
    /// Local failures are logged and treated as an empty result by the
    /// resolvers instead of aborting the whole invocation.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::ToolFailed { .. } | Self::ToolTimeout { .. } | Self::CommandFailed { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::BinaryNotFound(_) => Some("Pass an absolute path or check that the program is on PATH"),
            Self::StoreLock { .. } => {
                Some("Another sb instance may be populating this store. Run: sb cache clear <app>")
            }
            Self::CommandFailed { .. } => Some("Check that bubblewrap, ldd and find are installed"),
            Self::ToolTimeout { .. } => Some("Raise tools.timeout_secs in the config file"),
            _ => None,
        }
    }
}
