use std::path::{Path, PathBuf};

use tracing::debug;

use super::{GitAdapter, Worktree, WorktreeStatus};
use crate::cmd::Cmd;
use crate::error::CoreError;

/// Adapter that shells out to the `git` binary.
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitAdapter for GitCli {
    fn list_worktrees(&self, repo: &Path) -> Result<Vec<Worktree>, CoreError> {
        let output = Cmd::new("git")
            .workdir(repo)
            .args(["worktree", "list", "--porcelain"])
            .run_and_capture_stdout()?;
        Ok(parse_worktree_list(&output))
    }

    fn add_worktree(
        &self,
        repo: &Path,
        name: &str,
        base: Option<&str>,
    ) -> Result<Worktree, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::usage("worktree name must not be empty"));
        }
        let root = worktree_root_for(repo, name);
        let root_str = root.to_string_lossy().into_owned();

        let mut cmd = Cmd::new("git")
            .workdir(repo)
            .args(["worktree", "add", "-b", name])
            .arg(&root_str);
        if let Some(base) = base {
            cmd = cmd.arg(base);
        }
        cmd.run()?;
        debug!(repo = %repo.display(), name, "worktree created");

        Ok(Worktree {
            name: name.to_string(),
            branch: name.to_string(),
            root,
        })
    }

    fn remove_worktree(&self, repo: &Path, root: &Path) -> Result<(), CoreError> {
        let root_str = root.to_string_lossy().into_owned();
        let result = Cmd::new("git")
            .workdir(repo)
            .args(["worktree", "remove", "--force"])
            .arg(&root_str)
            .run();
        match result {
            Ok(_) => Ok(()),
            // Someone else already removed it; the verb is idempotent.
            Err(CoreError::External { stderr, .. })
                if stderr.contains("is not a working tree") =>
            {
                debug!(root = %root.display(), "worktree already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn status(&self, root: &Path) -> Result<WorktreeStatus, CoreError> {
        let output = Cmd::new("git")
            .workdir(root)
            .args(["status", "--porcelain"])
            .run_and_capture_stdout()?;
        Ok(parse_status(&output))
    }
}

/// Sibling directory next to the repository: `<repo>__worktrees/<name>`.
fn worktree_root_for(repo: &Path, name: &str) -> PathBuf {
    let repo_name = repo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let parent = repo.parent().unwrap_or(repo);
    parent.join(format!("{repo_name}__worktrees")).join(name)
}

/// Parse `git worktree list --porcelain`. Bare entries are skipped;
/// detached worktrees report `(detached)` as their branch.
fn parse_worktree_list(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    for block in output.trim().split("\n\n") {
        let mut root: Option<PathBuf> = None;
        let mut branch: Option<String> = None;
        let mut bare = false;

        for line in block.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                root = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
                branch = Some(b.to_string());
            } else if line.trim() == "detached" {
                branch = Some("(detached)".to_string());
            } else if line.trim() == "bare" {
                bare = true;
            }
        }

        if bare {
            continue;
        }
        if let (Some(root), Some(branch)) = (root, branch) {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            worktrees.push(Worktree { name, branch, root });
        }
    }
    worktrees
}

fn parse_status(output: &str) -> WorktreeStatus {
    let mut status = WorktreeStatus::default();
    for line in output.lines() {
        if line.starts_with("??") {
            status.untracked += 1;
        } else if !line.trim().is_empty() {
            status.modified += 1;
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_porcelain_worktree_list() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n\
                      worktree /repo__worktrees/feat\nHEAD def456\nbranch refs/heads/feat\n\n\
                      worktree /repo__worktrees/spike\nHEAD 987fed\ndetached\n";
        let worktrees = parse_worktree_list(output);
        assert_eq!(worktrees.len(), 3);
        assert_eq!(worktrees[0].branch, "main");
        assert_eq!(worktrees[1].name, "feat");
        assert_eq!(worktrees[2].branch, "(detached)");
    }

    #[test]
    fn skips_bare_entries() {
        let output = "worktree /repo/.bare\nbare\n\n\
                      worktree /repo__worktrees/feat\nHEAD def\nbranch refs/heads/feat\n";
        let worktrees = parse_worktree_list(output);
        assert_eq!(worktrees.len(), 1);
        assert_eq!(worktrees[0].name, "feat");
    }

    #[test]
    fn empty_output_is_no_worktrees() {
        assert!(parse_worktree_list("").is_empty());
    }

    #[test]
    fn status_counts_modified_and_untracked() {
        let status = parse_status(" M src/main.rs\n?? notes.md\nA  src/new.rs\n");
        assert_eq!(status.modified, 2);
        assert_eq!(status.untracked, 1);
        assert!(!status.clean());
        assert!(parse_status("").clean());
    }

    #[test]
    fn worktree_root_is_a_sibling_directory() {
        let root = worktree_root_for(Path::new("/home/me/proj"), "feat");
        assert_eq!(root, PathBuf::from("/home/me/proj__worktrees/feat"));
    }
}
