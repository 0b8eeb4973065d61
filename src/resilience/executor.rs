use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointManager;
use super::circuit::{CircuitBreaker, CircuitBreakerRegistry};
use super::classifier::{ClassifiedError, ErrorClassifier, OperationError};
use super::retry::{RetryCalculator, RetryConfig, RetryState};
use crate::error::{ResilienceError, ResilienceResult};

/// Where a successful run records its checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointTarget {
    pub project_id: String,
    pub stage: String,
    /// Caller payload stored alongside the run summary.
    pub state: serde_json::Value,
}

/// Policy for one `ResilientExecutor` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub retry: RetryConfig,
    pub circuit: Option<String>,
    pub checkpoint: Option<CheckpointTarget>,
    pub attempt_timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            ..Self::default()
        }
    }

    pub fn with_circuit(mut self, name: impl Into<String>) -> Self {
        self.circuit = Some(name.into());
        self
    }

    pub fn with_checkpoint(mut self, project_id: impl Into<String>, stage: impl Into<String>) -> Self {
        self.checkpoint = Some(CheckpointTarget {
            project_id: project_id.into(),
            stage: stage.into(),
            state: serde_json::Value::Null,
        });
        self
    }

    /// Attach a payload to the configured checkpoint. No-op without one.
    pub fn with_checkpoint_state(mut self, state: serde_json::Value) -> Self {
        if let Some(target) = self.checkpoint.as_mut() {
            target.state = state;
        }
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome plus the bookkeeping of the run that produced it.
#[derive(Debug)]
pub struct RunReport<T> {
    pub result: ResilienceResult<T>,
    pub state: RetryState,
}

/// Wraps unreliable async calls with retry, circuit breaking, checkpointing
/// and fallback.
#[derive(Clone)]
pub struct ResilientExecutor {
    registry: Arc<CircuitBreakerRegistry>,
    checkpoints: Option<CheckpointManager>,
    max_checkpoints: Option<usize>,
}

impl ResilientExecutor {
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            registry,
            checkpoints: None,
            max_checkpoints: None,
        }
    }

    /// Enable success checkpoints; `max_checkpoints` of 0 keeps everything.
    pub fn with_checkpoints(mut self, manager: CheckpointManager, max_checkpoints: usize) -> Self {
        self.checkpoints = Some(manager);
        self.max_checkpoints = (max_checkpoints > 0).then_some(max_checkpoints);
        self
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    pub async fn run<T, E, F, Fut>(&self, operation: F, opts: &RunOptions) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        self.run_with_report(operation, opts).await.result
    }

    /// Like `run`, but a `RetryExhausted` or `CircuitOpen` outcome is handed
    /// to `fallback` and its value returned instead.
    pub async fn run_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        operation: F,
        opts: &RunOptions,
        fallback: G,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
        G: FnOnce(ResilienceError) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.run(operation, opts).await {
            Err(err) if err.is_fallback_eligible() => {
                info!(
                    circuit = opts.circuit.as_deref().unwrap_or("-"),
                    error = %err,
                    "Using fallback"
                );
                Ok(fallback(err).await)
            }
            other => other,
        }
    }

    pub async fn run_with_report<T, E, F, Fut>(&self, mut operation: F, opts: &RunOptions) -> RunReport<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let mut state = RetryState::new();
        let result = self.drive(&mut operation, opts, &mut state).await;
        RunReport { result, state }
    }

    async fn drive<T, E, F, Fut>(
        &self,
        operation: &mut F,
        opts: &RunOptions,
        state: &mut RetryState,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        opts.retry.validate()?;
        if opts.checkpoint.is_some() && self.checkpoints.is_none() {
            return Err(ResilienceError::InvalidConfig(
                "checkpoint requested but executor has no checkpoint manager".into(),
            ));
        }

        let breaker = opts.circuit.as_deref().map(|name| self.registry.get(name));

        loop {
            if is_cancelled(opts.cancel.as_ref()) {
                return Err(ResilienceError::Cancelled {
                    attempts: state.attempts,
                });
            }

            if let Some(breaker) = &breaker {
                breaker.before_call()?;
            }

            let attempt = state.begin_attempt();
            match attempt_once(operation, opts.attempt_timeout).await {
                Ok(value) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    if let Some(target) = &opts.checkpoint {
                        self.save_checkpoint(target, breaker.as_deref(), state).await?;
                    }
                    debug!(attempt, "Operation succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }

                    if !RetryCalculator::should_retry(&opts.retry, attempt, &err) {
                        warn!(
                            attempt,
                            category = %err.category(),
                            retryable = err.is_retryable(),
                            error = %err.message(),
                            "Giving up"
                        );
                        state.record_failure(err.clone());
                        return Err(ResilienceError::RetryExhausted {
                            attempts: attempt,
                            last_error: err,
                        });
                    }

                    let delay = RetryCalculator::delay_for(&opts.retry, attempt, &err)?;
                    warn!(
                        attempt,
                        max_attempts = opts.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        category = %err.category(),
                        error = %err.message(),
                        "Attempt failed, retrying"
                    );
                    state.record_failure(err);

                    if !backoff(delay, opts.cancel.as_ref()).await {
                        return Err(ResilienceError::Cancelled {
                            attempts: state.attempts,
                        });
                    }
                    state.record_delay(delay);
                }
            }
        }
    }

    async fn save_checkpoint(
        &self,
        target: &CheckpointTarget,
        breaker: Option<&CircuitBreaker>,
        state: &RetryState,
    ) -> ResilienceResult<()> {
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };

        let snapshot = json!({
            "status": "succeeded",
            "attempts": state.attempts,
            "total_delay_ms": state.total_delay.as_millis() as u64,
            "circuit": breaker.map(|b| b.name()),
            "state": target.state,
        });
        let description = format!(
            "{} succeeded after {} attempt(s)",
            target.stage, state.attempts
        );
        manager
            .save(&target.project_id, &target.stage, snapshot, &description)
            .await?;

        if let Some(keep) = self.max_checkpoints {
            manager.cleanup_old(&target.project_id, keep).await?;
        }
        Ok(())
    }
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(CancellationToken::is_cancelled)
}

async fn attempt_once<T, E, F, Fut>(
    operation: &mut F,
    limit: Option<Duration>,
) -> Result<T, ClassifiedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StdError + Send + Sync + 'static,
{
    let fut = operation();
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(ErrorClassifier::classify),
            Err(_) => Err(ErrorClassifier::classify(OperationError::Timeout {
                operation: "attempt".into(),
                elapsed: limit,
            })),
        },
        None => fut.await.map_err(ErrorClassifier::classify),
    }
}

/// Sleep for `delay`; false if cancelled first.
async fn backoff(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        },
        None => {
            sleep(delay).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, ErrorCategory, RetryStrategy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn executor() -> ResilientExecutor {
        ResilientExecutor::new(Arc::new(CircuitBreakerRegistry::default()))
    }

    fn fixed(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, RetryStrategy::Fixed, Duration::from_secs(1))
    }

    /// Fails with `err` for the first `failures` calls, then returns the call number.
    fn flaky(
        calls: &AtomicU32,
        failures: u32,
        err: OperationError,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, OperationError>> + '_ {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures { Err(err.clone()) } else { Ok(n) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let calls = AtomicU32::new(0);
        let opts = RunOptions::new(fixed(3));
        let start = Instant::now();

        let report = executor()
            .run_with_report(
                flaky(&calls, 2, OperationError::Network("connection reset".into())),
                &opts,
            )
            .await;

        assert_eq!(report.result.unwrap(), 3);
        assert_eq!(report.state.attempts, 3);
        assert_eq!(report.state.total_delay, Duration::from_secs(2));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_last_error() {
        let calls = AtomicU32::new(0);
        let opts = RunOptions::new(fixed(3));

        let err = executor()
            .run(flaky(&calls, 10, OperationError::Network("down".into())), &opts)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ResilienceError::RetryExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.category(), ErrorCategory::Transient);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let opts = RunOptions::new(fixed(5));

        let err = executor()
            .run(flaky(&calls, 10, OperationError::Auth("bad key".into())), &opts)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_errors_capped() {
        let calls = AtomicU32::new(0);
        let opts = RunOptions::new(fixed(5));

        let result = executor()
            .run(
                flaky(&calls, 10, OperationError::Other("something odd".into())),
                &opts,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_short_circuits() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        registry.get_with_config(
            "codegen",
            CircuitBreakerConfig::new(2, 1, Duration::from_secs(30)),
        );
        let exec = ResilientExecutor::new(Arc::clone(&registry));
        let opts = RunOptions::new(RetryConfig::no_retry()).with_circuit("codegen");
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let r = exec
                .run(flaky(&calls, 10, OperationError::Network("down".into())), &opts)
                .await;
            assert!(matches!(r, Err(ResilienceError::RetryExhausted { .. })));
        }
        assert_eq!(registry.get("codegen").state(), CircuitState::Open);

        let r = exec
            .run(flaky(&calls, 10, OperationError::Network("down".into())), &opts)
            .await;
        assert!(matches!(r, Err(ResilienceError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_open_circuit() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        registry.get_with_config("search", CircuitBreakerConfig::new(1, 1, Duration::from_secs(60)));
        registry.get("search").record_failure();

        let exec = ResilientExecutor::new(registry);
        let opts = RunOptions::new(fixed(3)).with_circuit("search");
        let calls = AtomicU32::new(0);

        let value = exec
            .run_with_fallback(
                flaky(&calls, 0, OperationError::Other(String::new())),
                &opts,
                |_err| async { 0 },
            )
            .await
            .unwrap();

        assert_eq!(value, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let calls = AtomicU32::new(0);
        let opts = RunOptions::new(fixed(2)).with_attempt_timeout(Duration::from_secs(5));

        let result = executor()
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            sleep(Duration::from_secs(60)).await;
                        }
                        Ok::<_, OperationError>("done")
                    }
                },
                &opts,
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let token = CancellationToken::new();
        let opts = RunOptions::new(
            RetryConfig::new(5, RetryStrategy::Fixed, Duration::from_secs(60)),
        )
        .with_cancel(token.clone());

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let calls = AtomicU32::new(0);
        let err = executor()
            .run(flaky(&calls, 10, OperationError::Network("down".into())), &opts)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, ResilienceError::Cancelled { attempts: 1 }));
        assert!(!err.is_fallback_eligible());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_calls() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);
        let opts = RunOptions::default().with_cancel(token);

        let err = executor()
            .run(flaky(&calls, 0, OperationError::Other(String::new())), &opts)
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_writes_checkpoint_and_prunes() {
        let manager = CheckpointManager::in_memory();
        let exec = executor().with_checkpoints(manager.clone(), 2);
        let opts = RunOptions::new(fixed(1))
            .with_checkpoint("proj", "generation")
            .with_checkpoint_state(json!({"task": "api"}));

        for _ in 0..3 {
            let calls = AtomicU32::new(0);
            exec.run(flaky(&calls, 0, OperationError::Other(String::new())), &opts)
                .await
                .unwrap();
        }

        let all = manager.list("proj").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].stage, "generation");
        assert_eq!(all[0].state_snapshot["state"]["task"], "api");
        assert_eq!(all[0].state_snapshot["attempts"], 1);
    }

    #[tokio::test]
    async fn test_checkpoint_without_manager_is_config_error() {
        let calls = AtomicU32::new(0);
        let opts = RunOptions::default().with_checkpoint("proj", "planning");

        let err = executor()
            .run(flaky(&calls, 0, OperationError::Other(String::new())), &opts)
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::InvalidConfig(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_drives_delay() {
        let calls = AtomicU32::new(0);
        let opts = RunOptions::new(fixed(2));
        let start = Instant::now();

        let result = executor()
            .run(
                flaky(
                    &calls,
                    1,
                    OperationError::RateLimited {
                        retry_after: Some(Duration::from_secs(7)),
                    },
                ),
                &opts,
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }
}
