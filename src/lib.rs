pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod git;
pub mod resilience;
pub mod utils;
pub mod worktree;

pub use config::{ForgeConfig, ProjectPaths};
pub use dispatch::{CodeGenerator, TaskDispatcher};
pub use error::{ForgeError, ResilienceError, Result, WorktreeError};
pub use git::GitRunner;
pub use resilience::{
    CheckpointManager, CircuitBreaker, CircuitBreakerRegistry, ErrorClassifier, ResilientExecutor,
    RetryCalculator, RetryConfig, RunOptions,
};
pub use worktree::{WorktreeInfo, WorktreeManager};
