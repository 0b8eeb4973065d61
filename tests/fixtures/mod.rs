//! Scratch git repositories for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use forge::config::WorktreeConfig;
use forge::worktree::WorktreeManager;
use git2::{Repository, Signature};
use tempfile::TempDir;

pub struct TestRepo {
    pub dir: TempDir,
}

impl TestRepo {
    /// Fresh repository with one commit and a committer identity, so the
    /// `git` binary can commit inside worktrees.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let repo = Repository::init(dir.path()).expect("git init");

        let mut config = repo.config().expect("repo config");
        config.set_str("user.name", "Forge Test").expect("user.name");
        config
            .set_str("user.email", "forge@example.com")
            .expect("user.email");

        fs::write(dir.path().join("README.md"), "# scratch\n").expect("write readme");
        let mut index = repo.index().expect("index");
        index.add_path(Path::new("README.md")).expect("add");
        index.write().expect("index write");
        let tree_id = index.write_tree().expect("write tree");
        let tree = repo.find_tree(tree_id).expect("tree");
        let sig = Signature::now("Forge Test", "forge@example.com").expect("sig");
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .expect("commit");

        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn manager(&self) -> WorktreeManager {
        self.manager_with(WorktreeConfig::default())
    }

    pub fn manager_with(&self, config: WorktreeConfig) -> WorktreeManager {
        WorktreeManager::new(self.path(), ".worktrees", config).expect("worktree manager")
    }

    pub fn head(&self) -> String {
        let repo = Repository::open(self.path()).expect("open");
        repo.head()
            .and_then(|h| h.peel_to_commit())
            .map(|c| c.id().to_string())
            .expect("head")
    }
}
