//! Configuration loading and project layout.
//!
//! - `ForgeConfig`: top-level TOML configuration with validation
//! - Section types converted into resilience and worktree domain types
//! - `ProjectPaths`: directories derived from the project root

mod settings;

pub use settings::{
    CONFIG_FILE, CheckpointSettings, CircuitBreakerSettings, DispatchConfig, FORGE_DIR,
    ForgeConfig, ProjectPaths, ResilienceConfig, RetrySettings, WorktreeConfig,
};
