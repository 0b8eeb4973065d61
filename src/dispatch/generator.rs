use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resilience::OperationError;

/// What a backend gets to work with for one task.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationContext {
    pub project_id: String,
    pub task_id: String,
    pub description: String,
    pub worktree_path: PathBuf,
}

/// Backend reply. `files` maps worktree-relative paths to contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub success: bool,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerationOutput {
    pub fn ok(files: BTreeMap<String, String>) -> Self {
        Self {
            success: true,
            files,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            files: BTreeMap::new(),
            error: Some(error.into()),
        }
    }
}

/// Code generation backend. Transport failures come back as
/// `OperationError` so the executor can classify them without guessing.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, context: &GenerationContext)
    -> Result<GenerationOutput, OperationError>;
}
