//! Error types for the updater.

use thiserror::Error;

/// Updater errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum UpdaterError {
    /// Download tool failed and there is no server binary to fall back to.
    #[error("fetch_failed: exit_code={exit_code:?}, no local server binary")]
    FetchFailed { exit_code: Option<i32> },

    /// Mirroring the staging tree onto the live tree failed.
    #[error("sync_failed: exit_code={exit_code:?}")]
    SyncFailed { exit_code: Option<i32> },

    /// An external command could not be spawned.
    #[error("command_spawn_failed: {command}: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("command_failed: {command}: exit_code={exit_code:?}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
    },

    /// Environment held a value that could not be parsed.
    #[error("config_invalid: {name}={value}")]
    ConfigInvalid { name: String, value: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error.
    #[error("syscall error: {0}")]
    Syscall(#[from] nix::Error),
}

impl UpdaterError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            UpdaterError::FetchFailed { .. } => "fetch_failed",
            UpdaterError::SyncFailed { .. } => "sync_failed",
            UpdaterError::CommandSpawn { .. } => "command_spawn_failed",
            UpdaterError::CommandFailed { .. } => "command_failed",
            UpdaterError::ConfigInvalid { .. } => "config_invalid",
            UpdaterError::Io(_) => "io_error",
            UpdaterError::Syscall(_) => "syscall_error",
        }
    }

    /// Command line associated with this error, if any.
    pub fn command(&self) -> Option<&str> {
        match self {
            UpdaterError::CommandSpawn { command, .. }
            | UpdaterError::CommandFailed { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Exit code associated with this error, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            UpdaterError::FetchFailed { exit_code }
            | UpdaterError::SyncFailed { exit_code }
            | UpdaterError::CommandFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Whether this error ends the current cycle before the restart check.
    pub fn is_fatal_to_cycle(&self) -> bool {
        matches!(self, UpdaterError::FetchFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, UpdaterError>;
