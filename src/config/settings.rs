use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ForgeError, Result};
use crate::resilience::{CircuitBreakerConfig, RetryConfig, RetryStrategy};

pub const FORGE_DIR: &str = ".forge";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub resilience: ResilienceConfig,
    pub checkpoint: CheckpointSettings,
    pub worktree: WorktreeConfig,
    pub dispatch: DispatchConfig,
}

impl ForgeConfig {
    pub async fn load(forge_dir: &Path) -> Result<Self> {
        let config_path = forge_dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, forge_dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(forge_dir).await?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ForgeError::Config(e.to_string()))?;
        fs::write(forge_dir.join(CONFIG_FILE), content).await?;
        Ok(())
    }

    /// Collects every violation into a single error.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let retry = &self.resilience.retry;
        if retry.max_attempts == 0 {
            errors.push("resilience.retry.max_attempts must be at least 1".to_string());
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            errors.push("resilience.retry.base_delay_ms must be <= max_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            errors.push("resilience.retry.jitter_factor must be between 0.0 and 1.0".to_string());
        }

        let cb = &self.resilience.circuit_breaker;
        if cb.failure_threshold == 0 {
            errors.push("resilience.circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if cb.success_threshold == 0 {
            errors.push("resilience.circuit_breaker.success_threshold must be at least 1".to_string());
        }
        if let Some(window) = cb.window_size
            && window < cb.failure_threshold as usize
        {
            errors.push(format!(
                "resilience.circuit_breaker.window_size ({window}) must be >= failure_threshold ({})",
                cb.failure_threshold
            ));
        }

        if self.worktree.prefix.trim().is_empty() {
            errors.push("worktree.prefix must not be empty".to_string());
        }
        if self.worktree.base_dir.trim().is_empty() {
            errors.push("worktree.base_dir must not be empty".to_string());
        }
        if self.dispatch.circuit.trim().is_empty() {
            errors.push("dispatch.circuit must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForgeError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Per-attempt limit; 0 disables it.
    pub attempt_timeout_secs: u64,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
}

impl ResilienceConfig {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_secs > 0).then(|| Duration::from_secs(self.attempt_timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub unknown_max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::ExponentialJitter,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_factor: 0.25,
            unknown_max_attempts: 2,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.max_attempts,
            self.strategy,
            Duration::from_millis(self.base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
        .with_jitter(self.jitter_factor)
        .with_unknown_max_attempts(self.unknown_max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 30,
            window_size: None,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        let config = CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            Duration::from_secs(self.timeout_secs),
        );
        match self.window_size {
            Some(window) => config.with_window(window),
            None => config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Relative to the project root.
    pub dir: String,
    /// Newest checkpoints kept per project; 0 keeps all.
    pub max_checkpoints: usize,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: format!("{FORGE_DIR}/checkpoints"),
            max_checkpoints: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Relative to the project root.
    pub base_dir: String,
    /// Directory-name prefix marking managed worktrees.
    pub prefix: String,
    pub branch_prefix: String,
    /// Base for new branches; current HEAD when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_base_branch: Option<String>,
    pub delete_branch_on_remove: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: String::from(".worktrees"),
            prefix: String::from("forge-"),
            branch_prefix: String::from("forge/"),
            default_base_branch: None,
            delete_branch_on_remove: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Breaker guarding the code generation backend.
    pub circuit: String,
    pub stage: String,
    pub commit_message: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            circuit: String::from("codegen"),
            stage: String::from("generation"),
            commit_message: String::from("forge: generated code for {task}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub forge_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: PathBuf, config: &ForgeConfig) -> Self {
        Self {
            forge_dir: root.join(FORGE_DIR),
            checkpoints_dir: root.join(&config.checkpoint.dir),
            worktrees_dir: root.join(&config.worktree.base_dir),
            root,
        }
    }

    pub fn forge_dir_of(root: &Path) -> PathBuf {
        root.join(FORGE_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.forge_dir.join(CONFIG_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.config_file().exists()
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.forge_dir, &self.checkpoints_dir] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}
