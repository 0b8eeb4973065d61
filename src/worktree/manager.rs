use std::collections::HashMap;
use std::path::{Path, PathBuf};

use git2::Repository;
use parking_lot::RwLock;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{BatchOutcome, CommandOutput, TaskStatus, WorktreeInfo, WorktreeTask};
use crate::config::{ForgeConfig, ProjectPaths, WorktreeConfig};
use crate::error::{WorktreeError, WorktreeResult};
use crate::git::GitRunner;

/// Maps task ids to isolated git worktrees under one base directory.
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
    config: WorktreeConfig,
    tasks: RwLock<HashMap<String, WorktreeTask>>,
    // Serializes create/replace so two callers cannot race on the same path.
    create_lock: Mutex<()>,
}

impl WorktreeManager {
    /// `worktrees_dir` is resolved against the repository root when relative.
    pub fn new(
        repo_path: &Path,
        worktrees_dir: impl Into<PathBuf>,
        config: WorktreeConfig,
    ) -> WorktreeResult<Self> {
        let not_a_repo = || WorktreeError::NotAGitRepo {
            path: repo_path.to_path_buf(),
        };
        let repo = Repository::discover(repo_path).map_err(|_| not_a_repo())?;
        let workdir = repo.workdir().ok_or_else(not_a_repo)?;
        let repo_root = std::fs::canonicalize(workdir)?;

        let worktrees_dir = worktrees_dir.into();
        let worktrees_dir = if worktrees_dir.is_absolute() {
            worktrees_dir
        } else {
            repo_root.join(worktrees_dir)
        };

        debug!(
            root = %repo_root.display(),
            worktrees = %worktrees_dir.display(),
            "Worktree manager ready"
        );

        Ok(Self {
            repo_root,
            worktrees_dir,
            config,
            tasks: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        })
    }

    pub fn from_paths(paths: &ProjectPaths, config: &ForgeConfig) -> WorktreeResult<Self> {
        Self::new(&paths.root, &paths.worktrees_dir, config.worktree.clone())
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktrees_dir(&self) -> &Path {
        &self.worktrees_dir
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.repo_root)
    }

    /// Directory name for `name`, with the managed prefix applied once.
    pub fn normalize_name(&self, name: &str) -> WorktreeResult<String> {
        let cleaned: String = name
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.');
        if cleaned.is_empty() {
            return Err(WorktreeError::InvalidPath(PathBuf::from(name)));
        }

        let prefix = &self.config.prefix;
        if cleaned.starts_with(prefix.as_str()) {
            Ok(cleaned.to_string())
        } else {
            Ok(format!("{prefix}{cleaned}"))
        }
    }

    pub fn worktree_path(&self, name: &str) -> WorktreeResult<PathBuf> {
        Ok(self.worktrees_dir.join(self.normalize_name(name)?))
    }

    fn default_branch(&self, dir_name: &str) -> String {
        let stem = dir_name
            .strip_prefix(self.config.prefix.as_str())
            .unwrap_or(dir_name);
        format!("{}{}", self.config.branch_prefix, stem)
    }

    fn verify_base(&self, base: &str) -> WorktreeResult<()> {
        let repo = Repository::open(&self.repo_root)?;
        repo.revparse_single(base)
            .and_then(|obj| obj.peel_to_commit())
            .map(|_| ())
            .map_err(|_| WorktreeError::InvalidBaseBranch(base.to_string()))
    }

    fn is_main(&self, info: &WorktreeInfo) -> bool {
        same_path(&info.path, &self.repo_root)
    }

    fn is_managed(&self, info: &WorktreeInfo) -> bool {
        !self.is_main(info) && info.carries_prefix(&self.config.prefix, &self.config.branch_prefix)
    }

    pub async fn create_worktree(
        &self,
        name: &str,
        branch: Option<&str>,
        base_branch: Option<&str>,
        force: bool,
    ) -> WorktreeResult<WorktreeInfo> {
        let _guard = self.create_lock.lock().await;

        let dir_name = self.normalize_name(name)?;
        let path = self.worktrees_dir.join(&dir_name);
        // Derived branches, and any branch given an explicit base, start at the base.
        let reset = branch.is_none() || base_branch.is_some();
        let branch = branch
            .map(str::to_string)
            .unwrap_or_else(|| self.default_branch(&dir_name));
        let base = base_branch
            .map(str::to_string)
            .or_else(|| self.config.default_base_branch.clone())
            .unwrap_or_else(|| "HEAD".to_string());

        self.verify_base(&base)?;

        let registered = self.find(&path).await?;
        if registered.is_some() || path.exists() {
            if !force {
                return Err(WorktreeError::AlreadyExists { path });
            }
            warn!(path = %path.display(), "Replacing existing worktree");
            self.remove_at(&path, registered.as_ref(), true).await?;
        }

        fs::create_dir_all(&self.worktrees_dir).await?;
        self.git().worktree_add(&path, &branch, &base, reset).await?;

        let info = self
            .find(&path)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(dir_name.clone()))?;

        info!(
            name = %dir_name,
            branch = %branch,
            base = %base,
            path = %path.display(),
            "Created worktree"
        );
        Ok(info)
    }

    /// One worktree per task, best effort. Fails only when every task failed.
    pub async fn create_worktrees_for_tasks<S: AsRef<str>>(
        &self,
        task_ids: &[S],
    ) -> WorktreeResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for task_id in task_ids {
            let task_id = task_id.as_ref();
            let created = match self.create_worktree(task_id, None, None, false).await {
                Ok(info) => self.assign_task(task_id, info.name()).await,
                Err(e) => Err(e),
            };
            match created {
                Ok(task) => {
                    outcome.created.insert(task_id.to_string(), task.worktree);
                }
                Err(e) => {
                    warn!(task_id, error = %e, "Failed to create worktree for task");
                    outcome.failed.insert(task_id.to_string(), e.to_string());
                }
            }
        }

        if !task_ids.is_empty() && outcome.created.is_empty() {
            return Err(WorktreeError::BatchFailed {
                failures: outcome.failed.into_iter().collect(),
            });
        }

        info!(
            created = outcome.created.len(),
            failed = outcome.failed.len(),
            "Batch worktree creation finished"
        );
        Ok(outcome)
    }

    /// Every worktree registered against the repository, main checkout included.
    pub async fn list_worktrees(&self) -> WorktreeResult<Vec<WorktreeInfo>> {
        Ok(self
            .git()
            .worktree_list()
            .await?
            .into_iter()
            .filter(|r| !r.bare)
            .map(WorktreeInfo::from)
            .collect())
    }

    pub async fn list_managed(&self) -> WorktreeResult<Vec<WorktreeInfo>> {
        Ok(self
            .list_worktrees()
            .await?
            .into_iter()
            .filter(|w| self.is_managed(w))
            .collect())
    }

    async fn find(&self, path: &Path) -> WorktreeResult<Option<WorktreeInfo>> {
        Ok(self
            .list_worktrees()
            .await?
            .into_iter()
            .find(|w| same_path(&w.path, path)))
    }

    pub async fn get_worktree(&self, name: &str) -> WorktreeResult<Option<WorktreeInfo>> {
        let path = self.worktree_path(name)?;
        self.find(&path).await
    }

    async fn require(&self, name: &str) -> WorktreeResult<WorktreeInfo> {
        self.get_worktree(name)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(name.to_string()))
    }

    pub async fn get_worktree_for_task(&self, task_id: &str) -> WorktreeResult<Option<WorktreeInfo>> {
        let Some(path) = self.worktree_for_task(task_id) else {
            return Ok(None);
        };
        self.find(&path).await
    }

    /// Path of the worktree assigned to `task_id`, from the in-memory map.
    pub fn worktree_for_task(&self, task_id: &str) -> Option<PathBuf> {
        self.tasks
            .read()
            .get(task_id)
            .map(|t| t.worktree.path.clone())
    }

    pub fn task(&self, task_id: &str) -> Option<WorktreeTask> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<WorktreeTask> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks
    }

    /// Claim a worktree for a task. A worktree serves one task at a time;
    /// reassigning a task moves its claim.
    pub async fn assign_task(&self, task_id: &str, name: &str) -> WorktreeResult<WorktreeTask> {
        let info = self.require(name).await?;

        let mut tasks = self.tasks.write();
        if let Some(owner) = tasks
            .values()
            .find(|t| t.task_id != task_id && same_path(&t.worktree.path, &info.path))
        {
            return Err(WorktreeError::AlreadyAssigned {
                worktree: info.name().to_string(),
                task_id: owner.task_id.clone(),
            });
        }

        let task = WorktreeTask::new(task_id, info);
        tasks.insert(task_id.to_string(), task.clone());
        debug!(task_id, worktree = %task.worktree.name(), "Assigned task");
        Ok(task)
    }

    pub fn mark_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<String>,
    ) -> WorktreeResult<WorktreeTask> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WorktreeError::TaskNotFound(task_id.to_string()))?;
        task.transition(status, result);
        debug!(task_id, status = %status, "Task status updated");
        Ok(task.clone())
    }

    /// Missing worktrees are an error unless `force`, which makes this a no-op.
    pub async fn remove_worktree(&self, name: &str, force: bool) -> WorktreeResult<()> {
        let path = self.worktree_path(name)?;
        let registered = self.find(&path).await?;

        if registered.is_none() && !path.exists() {
            if force {
                info!(name, "Worktree already absent, nothing to remove");
                self.release(&path);
                return Ok(());
            }
            return Err(WorktreeError::NotFound(name.to_string()));
        }

        self.remove_at(&path, registered.as_ref(), force).await
    }

    async fn remove_at(
        &self,
        path: &Path,
        registered: Option<&WorktreeInfo>,
        force: bool,
    ) -> WorktreeResult<()> {
        match registered {
            Some(info) => {
                self.git().worktree_remove(path, force).await?;
                self.release(path);

                if self.config.delete_branch_on_remove
                    && let Some(branch) = &info.branch
                    && self.git().delete_branch(branch).await?
                {
                    info!(branch = %branch, "Deleted branch");
                }
            }
            None if force => {
                // Stray directory git no longer tracks.
                fs::remove_dir_all(path).await?;
                self.git().worktree_prune().await?;
                self.release(path);
            }
            None => return Err(WorktreeError::NotFound(path.display().to_string())),
        }

        info!(path = %path.display(), "Removed worktree");
        Ok(())
    }

    fn release(&self, path: &Path) {
        self.tasks
            .write()
            .retain(|_, t| !same_path(&t.worktree.path, path));
    }

    pub async fn lock_worktree(&self, name: &str, reason: Option<&str>) -> WorktreeResult<()> {
        let info = self.require(name).await?;
        self.git().worktree_lock(&info.path, reason).await?;
        info!(name = %info.name(), reason = reason.unwrap_or(""), "Locked worktree");
        Ok(())
    }

    pub async fn unlock_worktree(&self, name: &str) -> WorktreeResult<()> {
        let info = self.require(name).await?;
        self.git().worktree_unlock(&info.path).await?;
        info!(name = %info.name(), "Unlocked worktree");
        Ok(())
    }

    /// Remove managed worktrees, or only those whose task finished.
    /// Locked worktrees are always skipped.
    pub async fn clean_worktrees(&self, completed_only: bool) -> WorktreeResult<usize> {
        let mut removed = 0;

        for wt in self.list_managed().await? {
            if wt.is_locked {
                debug!(name = %wt.name(), "Skipping locked worktree");
                continue;
            }
            if completed_only && !self.is_finished(&wt.path) {
                continue;
            }

            match self.remove_at(&wt.path, Some(&wt), true).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(name = %wt.name(), error = %e, "Failed to clean worktree"),
            }
        }

        self.git().worktree_prune().await?;
        info!(removed, completed_only, "Cleaned worktrees");
        Ok(removed)
    }

    fn is_finished(&self, path: &Path) -> bool {
        self.tasks
            .read()
            .values()
            .any(|t| same_path(&t.worktree.path, path) && t.status.is_finished())
    }

    /// Run a shell command inside the worktree. A non-zero exit is reported
    /// in the output, not as an error.
    pub async fn run_in_worktree(&self, name: &str, command: &str) -> WorktreeResult<CommandOutput> {
        let info = self.require(name).await?;
        debug!(name = %info.name(), command, "Running command in worktree");

        let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
        let output = Command::new(shell)
            .args([flag, command])
            .current_dir(&info.path)
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Stage and commit everything; returns the full HEAD hash, which is the
    /// existing HEAD when there was nothing to commit.
    pub async fn commit_in_worktree(&self, name: &str, message: &str) -> WorktreeResult<String> {
        let info = self.require(name).await?;
        let git = GitRunner::new(&info.path);

        git.add_all().await?;
        let committed = git.commit(message).await?;
        let head = git.head().await?;

        if committed {
            info!(name = %info.name(), commit = %head, "Committed in worktree");
        } else {
            debug!(name = %info.name(), "Nothing to commit");
        }
        Ok(head)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let sig = git2::Signature::now("Forge Test", "forge@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        dir
    }

    fn manager(dir: &TempDir) -> WorktreeManager {
        WorktreeManager::new(dir.path(), ".worktrees", WorktreeConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), ".worktrees", WorktreeConfig::default());
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo { .. })));
    }

    #[test]
    fn test_normalize_name() {
        let dir = init_repo();
        let mgr = manager(&dir);
        assert_eq!(mgr.normalize_name("task-1").unwrap(), "forge-task-1");
        assert_eq!(mgr.normalize_name("forge-task-1").unwrap(), "forge-task-1");
        assert_eq!(mgr.normalize_name("api/users v2").unwrap(), "forge-api-users-v2");
        assert!(mgr.normalize_name("  /  ").is_err());
        assert_eq!(mgr.default_branch("forge-task-1"), "forge/task-1");
    }

    #[test]
    fn test_invalid_base_branch() {
        let dir = init_repo();
        let mgr = manager(&dir);
        assert!(matches!(
            mgr.verify_base("does-not-exist"),
            Err(WorktreeError::InvalidBaseBranch(_))
        ));
        assert!(mgr.verify_base("HEAD").is_ok());
    }

    #[tokio::test]
    async fn test_mark_status_unknown_task() {
        let dir = init_repo();
        let mgr = manager(&dir);
        assert!(matches!(
            mgr.mark_task_status("ghost", TaskStatus::Running, None),
            Err(WorktreeError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_same_path_literal_and_missing() {
        assert!(same_path(Path::new("/a/b"), Path::new("/a/b")));
        assert!(!same_path(Path::new("/nope/x"), Path::new("/nope/y")));
    }
}
