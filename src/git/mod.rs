//! Git command execution.
//!
//! `GitRunner` wraps the `git` binary for worktree, branch and commit
//! operations; `parse_worktree_porcelain` decodes `git worktree list`.

mod runner;

pub use runner::{GitRunner, WorktreeRecord, parse_worktree_porcelain};
