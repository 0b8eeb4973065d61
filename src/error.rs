use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::resilience::ClassifiedError;

/// Raised when a circuit refuses a call.
#[derive(Error, Debug, Clone)]
#[error("Circuit '{name}' is open, resets at {reset_time} (in {}ms)", retry_in.as_millis())]
pub struct CircuitOpenError {
    pub name: String,
    /// Wall-clock time at which the breaker will admit a probe.
    pub reset_time: DateTime<Utc>,
    pub retry_in: Duration,
}

#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    #[error("Retries exhausted after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: ClassifiedError,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid retry configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl ResilienceError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetryExhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
            _ => 0,
        }
    }

    /// Failures a configured fallback may absorb.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. } | Self::CircuitOpen(_))
    }
}

#[derive(Error, Debug)]
pub enum WorktreeError {
    #[error("Not a git repository: {}", path.display())]
    NotAGitRepo { path: PathBuf },

    #[error("Worktree already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Worktree not found: {0}")]
    NotFound(String),

    #[error("Base branch does not exist: {0}")]
    InvalidBaseBranch(String),

    #[error("Worktree {worktree} is already assigned to task {task_id}")]
    AlreadyAssigned { worktree: String, task_id: String },

    #[error("No worktree assigned to task: {0}")]
    TaskNotFound(String),

    #[error("git {args} failed: {stderr}")]
    GitCommand { args: String, stderr: String },

    #[error("All {} worktree creations failed", failures.len())]
    BatchFailed { failures: Vec<(String, String)> },

    #[error("Invalid path encoding: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<git2::Error> for WorktreeError {
    fn from(err: git2::Error) -> Self {
        Self::GitCommand {
            args: "libgit2".to_string(),
            stderr: err.message().to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Code generation failed: {0}")]
    Generation(String),

    #[error("Command `{command}` exited with {}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<CircuitOpenError> for ForgeError {
    fn from(err: CircuitOpenError) -> Self {
        Self::Resilience(ResilienceError::CircuitOpen(err))
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
pub type WorktreeResult<T> = std::result::Result<T, WorktreeError>;
pub type ResilienceResult<T> = std::result::Result<T, ResilienceError>;
