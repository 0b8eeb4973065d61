//! Fault tolerance for calls into unreliable collaborators.
//!
//! - Failure classification into retry categories
//! - Backoff calculation (fixed, linear, exponential, jittered)
//! - Named circuit breakers with single-flight half-open probing
//! - Append-only progress checkpoints
//! - `ResilientExecutor`, which composes all of the above

mod checkpoint;
mod circuit;
mod classifier;
mod executor;
mod retry;

pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use circuit::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
    CircuitState, CircuitStats,
};
pub use classifier::{ClassifiedError, ErrorCategory, ErrorClassifier, OperationError};
pub use executor::{CheckpointTarget, ResilientExecutor, RunOptions, RunReport};
pub use retry::{RetryCalculator, RetryConfig, RetryState, RetryStrategy};
