//! Isolated git worktrees for concurrent tasks.
//!
//! - `WorktreeManager`: create, list, lock, clean and remove worktrees
//! - Task assignment: at most one task per worktree, with status tracking

mod manager;
mod types;

pub use manager::WorktreeManager;
pub use types::{
    BatchOutcome, CommandOutput, DEFAULT_BRANCH_PREFIX, DEFAULT_PREFIX, TaskStatus, WorktreeInfo,
    WorktreeTask,
};
