use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::fs;
use tracing::{info, warn};

use super::generator::{CodeGenerator, GenerationContext, GenerationOutput};
use crate::config::{DispatchConfig, ForgeConfig};
use crate::error::{ForgeError, Result};
use crate::resilience::{OperationError, ResilientExecutor, RetryConfig, RunOptions};
use crate::worktree::{TaskStatus, WorktreeManager};

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub commit: Option<String>,
    pub files_written: usize,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn failed(task_id: &str, error: impl ToString) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Failed,
            commit: None,
            files_written: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Runs code generation for a set of tasks, each in its own worktree,
/// through the resilient executor.
pub struct TaskDispatcher {
    executor: ResilientExecutor,
    worktrees: Arc<WorktreeManager>,
    generator: Arc<dyn CodeGenerator>,
    retry: RetryConfig,
    attempt_timeout: Option<Duration>,
    config: DispatchConfig,
}

impl TaskDispatcher {
    pub fn new(
        executor: ResilientExecutor,
        worktrees: Arc<WorktreeManager>,
        generator: Arc<dyn CodeGenerator>,
        config: &ForgeConfig,
    ) -> Self {
        Self {
            executor,
            worktrees,
            generator,
            retry: config.resilience.retry.to_retry_config(),
            attempt_timeout: config.resilience.attempt_timeout(),
            config: config.dispatch.clone(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.worktrees
    }

    pub async fn dispatch(&self, project_id: &str, tasks: &[TaskSpec]) -> Result<DispatchReport> {
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let batch = self.worktrees.create_worktrees_for_tasks(&ids).await?;

        let runs = tasks
            .iter()
            .filter(|t| batch.created.contains_key(&t.id))
            .map(|task| self.run_task(project_id, task));
        let mut outcomes = join_all(runs).await;

        outcomes.extend(
            batch
                .failed
                .iter()
                .map(|(task_id, error)| TaskOutcome::failed(task_id, error)),
        );
        outcomes.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let report = DispatchReport { outcomes };
        info!(
            project_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Dispatch finished"
        );
        Ok(report)
    }

    async fn run_task(&self, project_id: &str, task: &TaskSpec) -> TaskOutcome {
        if let Err(e) = self
            .worktrees
            .mark_task_status(&task.id, TaskStatus::Running, None)
        {
            return TaskOutcome::failed(&task.id, e);
        }

        match self.generate_and_commit(project_id, task).await {
            Ok((commit, files_written)) => {
                let summary = format!("{files_written} file(s), commit {}", short(&commit));
                let status = TaskStatus::Completed;
                if let Err(e) = self
                    .worktrees
                    .mark_task_status(&task.id, status, Some(summary))
                {
                    warn!(task_id = %task.id, error = %e, "Failed to record task completion");
                }
                TaskOutcome {
                    task_id: task.id.clone(),
                    status,
                    commit: Some(commit),
                    files_written,
                    error: None,
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task failed");
                if let Err(mark_err) =
                    self.worktrees
                        .mark_task_status(&task.id, TaskStatus::Failed, Some(e.to_string()))
                {
                    warn!(task_id = %task.id, error = %mark_err, "Failed to record task failure");
                }
                TaskOutcome::failed(&task.id, e)
            }
        }
    }

    async fn generate_and_commit(&self, project_id: &str, task: &TaskSpec) -> Result<(String, usize)> {
        let worktree_path = self
            .worktrees
            .worktree_for_task(&task.id)
            .ok_or_else(|| ForgeError::Generation(format!("no worktree for task {}", task.id)))?;

        let context = GenerationContext {
            project_id: project_id.to_string(),
            task_id: task.id.clone(),
            description: task.description.clone(),
            worktree_path: worktree_path.clone(),
        };

        let mut opts = RunOptions::new(self.retry.clone()).with_circuit(self.config.circuit.clone());
        if self.executor.checkpoints().is_some() {
            opts = opts
                .with_checkpoint(project_id, self.config.stage.clone())
                .with_checkpoint_state(json!({ "task_id": task.id }));
        }
        opts.attempt_timeout = self.attempt_timeout;

        let generator = &self.generator;
        let ctx = &context;
        let output = self
            .executor
            .run(
                move || async move {
                    let output = generator.generate(ctx).await?;
                    if output.success {
                        Ok(output)
                    } else {
                        Err(OperationError::Other(
                            output
                                .error
                                .unwrap_or_else(|| "generation reported failure".into()),
                        ))
                    }
                },
                &opts,
            )
            .await?;

        let files_written = write_files(&worktree_path, &output).await?;
        let message = self.config.commit_message.replace("{task}", &task.id);
        let name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ForgeError::Generation(format!("bad worktree path for {}", task.id)))?;
        let commit = self.worktrees.commit_in_worktree(name, &message).await?;

        Ok((commit, files_written))
    }
}

async fn write_files(root: &Path, output: &GenerationOutput) -> Result<usize> {
    for (relative, content) in &output.files {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.is_empty() {
            return Err(ForgeError::Generation(format!(
                "refusing to write outside worktree: {relative}"
            )));
        }

        let target = root.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, content).await?;
    }
    Ok(output.files.len())
}

fn short(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_files_creates_nested_dirs() {
        let dir = TempDir::new().unwrap();
        let mut files = BTreeMap::new();
        files.insert("src/api/mod.rs".to_string(), "pub fn api() {}".to_string());
        files.insert("README.md".to_string(), "# hi".to_string());

        let n = write_files(dir.path(), &GenerationOutput::ok(files)).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/api/mod.rs")).unwrap(),
            "pub fn api() {}"
        );
    }

    #[tokio::test]
    async fn test_write_files_rejects_escape() {
        let dir = TempDir::new().unwrap();
        for bad in ["../outside.txt", "/etc/passwd", ""] {
            let mut files = BTreeMap::new();
            files.insert(bad.to_string(), "x".to_string());
            let result = write_files(dir.path(), &GenerationOutput::ok(files)).await;
            assert!(matches!(result, Err(ForgeError::Generation(_))), "{bad}");
        }
    }

    #[test]
    fn test_short_commit() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}
