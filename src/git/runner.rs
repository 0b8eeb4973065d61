use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{WorktreeError, WorktreeResult};
use crate::utils::truncate_with_marker;

const MAX_STDERR_LEN: usize = 2000;

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeRecord {
    pub path: PathBuf,
    pub head: String,
    /// Short branch name; `None` when detached or bare.
    pub branch: Option<String>,
    pub bare: bool,
    /// `Some("")` when locked without a reason.
    pub locked: Option<String>,
    pub prunable: bool,
}

pub fn parse_worktree_porcelain(stdout: &str) -> Vec<WorktreeRecord> {
    let mut records = Vec::new();
    let mut current: Option<WorktreeRecord> = None;

    for line in stdout.lines() {
        if line.is_empty() {
            records.extend(current.take());
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        if key == "worktree" {
            records.extend(current.take());
            current = Some(WorktreeRecord {
                path: PathBuf::from(value),
                ..WorktreeRecord::default()
            });
            continue;
        }
        let Some(record) = current.as_mut() else {
            continue;
        };
        match key {
            "HEAD" => record.head = value.to_string(),
            "branch" => {
                record.branch = Some(value.strip_prefix("refs/heads/").unwrap_or(value).to_string())
            }
            "bare" => record.bare = true,
            "locked" => record.locked = Some(value.to_string()),
            "prunable" => record.prunable = true,
            _ => {}
        }
    }
    records.extend(current);
    records
}

fn path_arg(path: &Path) -> WorktreeResult<&str> {
    path.to_str()
        .ok_or_else(|| WorktreeError::InvalidPath(path.to_path_buf()))
}

fn command_error(args: &[&str], output: &Output) -> WorktreeError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    WorktreeError::GitCommand {
        args: args.join(" "),
        stderr: truncate_with_marker(stderr.trim(), MAX_STDERR_LEN),
    }
}

/// Thin async wrapper over the `git` binary, bound to one working directory.
pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> WorktreeResult<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(args = ?args, stderr = %stderr.trim(), "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> WorktreeResult<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(command_error(args, &output));
        }
        Ok(output)
    }

    async fn stdout(&self, args: &[&str]) -> WorktreeResult<String> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn add_all(&self) -> WorktreeResult<()> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Whether the index differs from HEAD.
    pub async fn has_staged_changes(&self) -> WorktreeResult<bool> {
        let args = ["diff", "--cached", "--quiet"];
        let output = self.run(&args).await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(command_error(&args, &output)),
        }
    }

    /// Commit the index. Returns false when nothing was staged.
    pub async fn commit(&self, message: &str) -> WorktreeResult<bool> {
        if !self.has_staged_changes().await? {
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message]).await?;
        Ok(true)
    }

    pub async fn head(&self) -> WorktreeResult<String> {
        self.stdout(&["rev-parse", "HEAD"]).await
    }

    pub async fn branch_exists(&self, branch: &str) -> WorktreeResult<bool> {
        let output = self
            .run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await?;
        Ok(output.status.success())
    }

    pub async fn delete_branch(&self, branch: &str) -> WorktreeResult<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    /// Check `branch` out at `path`. A missing branch is created from `base`;
    /// with `reset` an existing one is moved to `base` first (`-B`).
    pub async fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
        reset: bool,
    ) -> WorktreeResult<()> {
        let path_str = path_arg(path)?;

        if reset {
            self.run_checked(&["worktree", "add", "-B", branch, path_str, base])
                .await?;
        } else if self.branch_exists(branch).await? {
            self.run_checked(&["worktree", "add", path_str, branch])
                .await?;
        } else {
            self.run_checked(&["worktree", "add", "-b", branch, path_str, base])
                .await?;
        }
        Ok(())
    }

    /// `force` also removes dirty and locked worktrees.
    pub async fn worktree_remove(&self, path: &Path, force: bool) -> WorktreeResult<()> {
        let path_str = path_arg(path)?;
        let args: Vec<&str> = if force {
            vec!["worktree", "remove", "--force", "--force", path_str]
        } else {
            vec!["worktree", "remove", path_str]
        };
        self.run_checked(&args).await?;
        Ok(())
    }

    pub async fn worktree_list(&self) -> WorktreeResult<Vec<WorktreeRecord>> {
        let output = self
            .run_checked(&["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_porcelain(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    pub async fn worktree_lock(&self, path: &Path, reason: Option<&str>) -> WorktreeResult<()> {
        let path_str = path_arg(path)?;
        let mut args = vec!["worktree", "lock"];
        if let Some(reason) = reason {
            args.extend(["--reason", reason]);
        }
        args.push(path_str);
        self.run_checked(&args).await?;
        Ok(())
    }

    pub async fn worktree_unlock(&self, path: &Path) -> WorktreeResult<()> {
        let path_str = path_arg(path)?;
        self.run_checked(&["worktree", "unlock", path_str]).await?;
        Ok(())
    }

    /// Drop metadata for worktrees whose directories have vanished.
    pub async fn worktree_prune(&self) -> WorktreeResult<()> {
        if let Err(e) = self.run_checked(&["worktree", "prune"]).await {
            warn!(error = %e, "Worktree prune failed");
        }
        Ok(())
    }
}
