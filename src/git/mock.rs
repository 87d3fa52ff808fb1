//! In-memory git adapter for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{GitAdapter, Worktree, WorktreeStatus};
use crate::error::CoreError;

#[derive(Default)]
pub struct MockGit {
    pub worktrees: Mutex<HashMap<PathBuf, Vec<Worktree>>>,
    pub statuses: Mutex<HashMap<PathBuf, WorktreeStatus>>,
    pub list_error: Mutex<Option<CoreError>>,
    pub removed: Mutex<Vec<PathBuf>>,
}

impl MockGit {
    pub fn with_worktrees(repo: &Path, worktrees: Vec<Worktree>) -> Self {
        let mock = Self::default();
        mock.worktrees
            .lock()
            .unwrap()
            .insert(repo.to_path_buf(), worktrees);
        mock
    }
}

impl GitAdapter for MockGit {
    fn list_worktrees(&self, repo: &Path) -> Result<Vec<Worktree>, CoreError> {
        if let Some(err) = self.list_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self
            .worktrees
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    fn add_worktree(
        &self,
        repo: &Path,
        name: &str,
        _base: Option<&str>,
    ) -> Result<Worktree, CoreError> {
        let worktree = Worktree {
            name: name.to_string(),
            branch: name.to_string(),
            root: repo.join("..").join("worktrees").join(name),
        };
        self.worktrees
            .lock()
            .unwrap()
            .entry(repo.to_path_buf())
            .or_default()
            .push(worktree.clone());
        Ok(worktree)
    }

    fn remove_worktree(&self, repo: &Path, root: &Path) -> Result<(), CoreError> {
        if let Some(list) = self.worktrees.lock().unwrap().get_mut(repo) {
            list.retain(|w| w.root != root);
        }
        self.removed.lock().unwrap().push(root.to_path_buf());
        Ok(())
    }

    fn status(&self, root: &Path) -> Result<WorktreeStatus, CoreError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(root)
            .copied()
            .unwrap_or_default())
    }
}
