use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::git::WorktreeRecord;

pub const DEFAULT_PREFIX: &str = "forge-";
pub const DEFAULT_BRANCH_PREFIX: &str = "forge/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: String,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
}

impl WorktreeInfo {
    /// Final path segment.
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn is_forge_worktree(&self) -> bool {
        self.carries_prefix(DEFAULT_PREFIX, DEFAULT_BRANCH_PREFIX)
    }

    pub(crate) fn carries_prefix(&self, prefix: &str, branch_prefix: &str) -> bool {
        self.name().starts_with(prefix)
            || self
                .branch
                .as_deref()
                .is_some_and(|b| b.starts_with(branch_prefix))
    }
}

impl From<WorktreeRecord> for WorktreeInfo {
    fn from(record: WorktreeRecord) -> Self {
        Self {
            path: record.path,
            branch: record.branch,
            head: record.head,
            is_locked: record.locked.is_some(),
            lock_reason: record.locked.filter(|r| !r.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A task's claim on a worktree. Holds a view of the worktree, not the
/// directory itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeTask {
    pub task_id: String,
    pub worktree: WorktreeInfo,
    pub branch: Option<String>,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

impl WorktreeTask {
    pub fn new(task_id: impl Into<String>, worktree: WorktreeInfo) -> Self {
        Self {
            task_id: task_id.into(),
            branch: worktree.branch.clone(),
            worktree,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn transition(&mut self, status: TaskStatus, result: Option<String>) {
        let now = Utc::now();
        match status {
            TaskStatus::Pending => {}
            TaskStatus::Running => {
                self.started_at.get_or_insert(now);
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.started_at.get_or_insert(now);
                self.completed_at = Some(now);
                self.result = result;
            }
        }
        self.status = status;
    }
}

/// Per-task results of a batch creation. Failures keep their error text.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub created: BTreeMap<String, WorktreeInfo>,
    pub failed: BTreeMap<String, String>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}
