mod fixtures;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fixtures::TestRepo;
use forge::config::ForgeConfig;
use forge::dispatch::{CodeGenerator, GenerationContext, GenerationOutput, TaskDispatcher, TaskSpec};
use forge::resilience::{
    CheckpointManager, CircuitBreakerRegistry, OperationError, ResilientExecutor, RetryConfig,
    RetryStrategy,
};
use forge::worktree::TaskStatus;
use parking_lot::Mutex;

/// Fails each task's first call with a network error. Tasks in `reject`
/// always fail authentication; tasks in `refuse` get a failed reply.
#[derive(Default)]
struct FlakyGenerator {
    calls: Mutex<HashMap<String, u32>>,
    reject: Vec<String>,
    refuse: Vec<String>,
}

#[async_trait]
impl CodeGenerator for FlakyGenerator {
    async fn generate(
        &self,
        context: &GenerationContext,
    ) -> Result<GenerationOutput, OperationError> {
        if self.reject.contains(&context.task_id) {
            return Err(OperationError::Auth("key revoked".into()));
        }
        if self.refuse.contains(&context.task_id) {
            return Ok(GenerationOutput::failed("prompt rejected: malformed request"));
        }

        let call = {
            let mut calls = self.calls.lock();
            let n = calls.entry(context.task_id.clone()).or_default();
            *n += 1;
            *n
        };
        if call == 1 {
            return Err(OperationError::Network("connection reset".into()));
        }

        let mut files = BTreeMap::new();
        files.insert(
            format!("src/{}.rs", context.task_id),
            format!("// {}\npub fn run() {{}}\n", context.description),
        );
        Ok(GenerationOutput::ok(files))
    }
}

fn dispatcher(repo: &TestRepo, generator: FlakyGenerator, checkpoints: &CheckpointManager) -> TaskDispatcher {
    let config = ForgeConfig::default();
    let executor = ResilientExecutor::new(Arc::new(CircuitBreakerRegistry::default()))
        .with_checkpoints(checkpoints.clone(), 0);
    TaskDispatcher::new(executor, Arc::new(repo.manager()), Arc::new(generator), &config)
        .with_retry(RetryConfig::new(3, RetryStrategy::Fixed, Duration::from_millis(5)))
}

#[tokio::test]
async fn test_dispatch_generates_and_commits_per_task() {
    let repo = TestRepo::new();
    let checkpoints = CheckpointManager::in_memory();
    let dispatcher = dispatcher(&repo, FlakyGenerator::default(), &checkpoints);

    let tasks = [
        TaskSpec::new("api", "users endpoint"),
        TaskSpec::new("ui", "login form"),
    ];
    let report = dispatcher.dispatch("proj", &tasks).await.unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 0);

    for outcome in &report.outcomes {
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.files_written, 1);
        assert_eq!(outcome.commit.as_ref().unwrap().len(), 40);

        let path = dispatcher
            .worktrees()
            .worktree_for_task(&outcome.task_id)
            .unwrap();
        let file = path.join(format!("src/{}.rs", outcome.task_id));
        assert!(file.exists());

        let task = dispatcher.worktrees().task(&outcome.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.result.unwrap().contains("1 file(s)"));
    }

    // Main checkout is untouched.
    assert!(!repo.path().join("src").exists());
    assert_eq!(checkpoints.list("proj").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_dispatch_isolates_failures() {
    let repo = TestRepo::new();
    let checkpoints = CheckpointManager::in_memory();
    let generator = FlakyGenerator {
        reject: vec!["bad".into()],
        ..FlakyGenerator::default()
    };
    let dispatcher = dispatcher(&repo, generator, &checkpoints);

    let tasks = [TaskSpec::new("good", "ok"), TaskSpec::new("bad", "nope")];
    let report = dispatcher.dispatch("proj", &tasks).await.unwrap();

    assert_eq!(report.succeeded(), 1);
    let bad = report.outcomes.iter().find(|o| o.task_id == "bad").unwrap();
    assert_eq!(bad.status, TaskStatus::Failed);
    assert!(bad.error.as_ref().unwrap().contains("1 attempt"));

    let task = dispatcher.worktrees().task("bad").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn test_failed_reply_marks_task_failed() {
    let repo = TestRepo::new();
    let checkpoints = CheckpointManager::in_memory();
    let generator = FlakyGenerator {
        refuse: vec!["odd".into()],
        ..FlakyGenerator::default()
    };
    let dispatcher = dispatcher(&repo, generator, &checkpoints);

    let report = dispatcher
        .dispatch("proj", &[TaskSpec::new("odd", "unclear ask")])
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, TaskStatus::Failed);
    let error = outcome.error.as_ref().unwrap();
    assert!(error.contains("malformed request"));
    assert!(error.contains("1 attempt"));
    assert!(outcome.commit.is_none());
    assert!(checkpoints.get_latest("proj").await.unwrap().is_none());
}
