//! Per-workspace metadata store.
//!
//! Layout: `<root>/<id>/workspace.json`, with the per-workspace lock at
//! `<root>/<id>.lock` — outside the workspace directory, so deleting the
//! directory never removes the lock another process may be holding.
//!
//! The legacy filename `worktree.json` is accepted on read; every save
//! migrates to the current name.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{TabInfo, Workspace};
use crate::error::CoreError;
use crate::lockfile::{self, FileLock};
use crate::{fsutil, paths};

pub const WORKSPACE_FILE: &str = "workspace.json";
pub const LEGACY_WORKSPACE_FILE: &str = "worktree.json";

/// A workspace as loaded from disk, plus the soft warning the UI may show
/// when the data came from a legacy file.
#[derive(Debug, Clone)]
pub struct LoadedWorkspace {
    pub workspace: Workspace,
    pub warning: Option<String>,
}

pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.amux/workspaces`.
    pub fn default_root() -> Result<PathBuf, CoreError> {
        let home = home::home_dir()
            .ok_or_else(|| CoreError::usage("cannot determine home directory"))?;
        Ok(home.join(".amux").join("workspaces"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.dir(id).join(WORKSPACE_FILE)
    }

    fn legacy_file_path(&self, id: &str) -> PathBuf {
        self.dir(id).join(LEGACY_WORKSPACE_FILE)
    }

    pub fn lock_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.lock"))
    }

    fn lock(&self, id: &str) -> Result<FileLock, CoreError> {
        lockfile::lock_exclusive(&self.lock_path(id))
    }

    /// Lock several workspaces at once, in sorted id order so two bulk
    /// operations can never deadlock against each other.
    pub fn lock_many(&self, ids: &[String]) -> Result<Vec<FileLock>, CoreError> {
        for id in ids {
            paths::validate_workspace_id(id)?;
        }
        let keyed = ids
            .iter()
            .map(|id| (id.clone(), self.lock_path(id)))
            .collect();
        lockfile::lock_all_sorted(keyed)
    }

    /// Does a metadata file exist for this id?
    pub fn contains(&self, id: &str) -> bool {
        paths::validate_workspace_id(id).is_ok()
            && (self.file_path(id).exists() || self.legacy_file_path(id).exists())
    }

    /// Enumerate every readable workspace, keyed by directory name.
    /// Unreadable entries are skipped with a warning; callers that need to
    /// distinguish corruption use `list_by_repo` or `load`.
    pub fn list(&self) -> Result<Vec<(String, Workspace)>, CoreError> {
        let mut out = Vec::new();
        for id in self.entry_ids()? {
            match self.load(&id) {
                Ok(Some(loaded)) => out.push((id, loaded.workspace)),
                Ok(None) => {}
                Err(e) => warn!(id = %id, error = %e, "skipping unreadable workspace"),
            }
        }
        Ok(out)
    }

    fn entry_ids(&self) -> Result<Vec<String>, CoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::Io(e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if paths::validate_workspace_id(&name).is_err() {
                continue;
            }
            if self.file_path(&name).exists() || self.legacy_file_path(&name).exists() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load one workspace. `Ok(None)` when no file exists; corruption is an
    /// error and never silently replaced with defaults.
    pub fn load(&self, id: &str) -> Result<Option<LoadedWorkspace>, CoreError> {
        paths::validate_workspace_id(id)?;
        let primary = self.file_path(id);
        match read_workspace(&primary)? {
            Some(ws) => Ok(Some(LoadedWorkspace {
                workspace: ws,
                warning: None,
            })),
            None => {
                let legacy = self.legacy_file_path(id);
                match read_workspace(&legacy)? {
                    Some(ws) => Ok(Some(LoadedWorkspace {
                        workspace: ws,
                        warning: Some(format!(
                            "workspace {id} uses legacy {LEGACY_WORKSPACE_FILE}; it will migrate on next save"
                        )),
                    })),
                    None => Ok(None),
                }
            }
        }
    }

    /// Persist a workspace under the id derived from `(repo, root)`.
    /// Returns the id. Migrates any legacy file away as a side effect.
    pub fn save(&self, workspace: &Workspace) -> Result<String, CoreError> {
        let id = self.validate_for_save(workspace)?;
        let _lock = self.lock(&id)?;
        self.write_locked(&id, workspace)?;
        Ok(id)
    }

    fn validate_for_save(&self, workspace: &Workspace) -> Result<String, CoreError> {
        if paths::normalize(&workspace.repo).is_empty() {
            return Err(CoreError::usage("workspace repo must not be empty"));
        }
        if paths::normalize(&workspace.root).is_empty() {
            return Err(CoreError::usage("workspace root must not be empty"));
        }
        Ok(workspace.id())
    }

    /// Write while the caller already holds the per-workspace lock.
    fn write_locked(&self, id: &str, workspace: &Workspace) -> Result<(), CoreError> {
        let path = self.file_path(id);
        let bytes =
            serde_json::to_vec_pretty(workspace).map_err(|e| CoreError::Corruption {
                primary: path.clone(),
                backup: None,
                reason: e.to_string(),
            })?;
        fsutil::write_atomic(&path, &bytes)?;

        let legacy = self.legacy_file_path(id);
        if legacy.exists() {
            fs::remove_file(&legacy)?;
            debug!(id = %id, "migrated legacy worktree.json");
        }
        Ok(())
    }

    /// Delete a workspace's metadata directory. The lock file survives by
    /// construction. Missing directory is a no-op.
    pub fn delete(&self, id: &str) -> Result<(), CoreError> {
        paths::validate_workspace_id(id)?;
        let _lock = self.lock(id)?;
        match fs::remove_dir_all(self.dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// Merge stored metadata into a discovered skeleton.
    ///
    /// `Ok(None)` means no metadata exists (not an error); corruption at
    /// the hashed id surfaces as an error and never overwrites. When the
    /// hashed id misses, a path-based scan finds workspaces whose
    /// canonicalized `(repo, root)` match — this covers ids minted before
    /// a symlink appeared or a directory moved.
    pub fn load_metadata_for(
        &self,
        skeleton: &Workspace,
    ) -> Result<Option<Workspace>, CoreError> {
        let id = skeleton.id();
        if self.contains(&id) {
            let loaded = self
                .load(&id)?
                .ok_or_else(|| CoreError::NotFound(format!("workspace {id}")))?;
            let mut merged = Workspace::overlay_stored(skeleton, loaded.workspace);
            merged.apply_defaults();
            return Ok(Some(merged));
        }

        let repo_key = paths::normalize(&skeleton.repo);
        let root_key = paths::normalize(&skeleton.root);
        for (other_id, stored) in self.list()? {
            if paths::normalize(&stored.repo) == repo_key
                && paths::normalize(&stored.root) == root_key
            {
                debug!(id = %id, matched = %other_id, "workspace found via path fallback");
                let mut merged = Workspace::overlay_stored(skeleton, stored);
                merged.apply_defaults();
                return Ok(Some(merged));
            }
        }
        Ok(None)
    }

    /// Active (non-archived) workspaces whose stored `repo` matches after
    /// canonicalization. Legacy entries with an empty `root` are skipped —
    /// those are only reachable through `load_metadata_for`.
    ///
    /// When nothing matches *and* unreadable entries exist that either
    /// point at this repo or carry no repo hint at all, the caller cannot
    /// distinguish "no workspaces" from "my data is corrupt" — so this
    /// returns the corruption error instead of an empty list.
    pub fn list_by_repo(&self, repo: &str) -> Result<Vec<Workspace>, CoreError> {
        let repo_key = paths::normalize(repo);
        let mut results = Vec::new();
        let mut suspect: Option<(PathBuf, String)> = None;
        let mut suspects = 0usize;

        for id in self.entry_ids()? {
            match self.load(&id) {
                Ok(Some(loaded)) => {
                    let mut ws = loaded.workspace;
                    if ws.root.is_empty() || ws.archived {
                        continue;
                    }
                    if paths::normalize(&ws.repo) == repo_key {
                        ws.apply_defaults();
                        results.push(ws);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let hint = self.salvage_repo_hint(&id);
                    let relevant = match &hint {
                        Some(h) => paths::normalize(h) == repo_key,
                        None => true,
                    };
                    if relevant {
                        suspects += 1;
                        if suspect.is_none() {
                            suspect = Some((self.file_path(&id), e.to_string()));
                        }
                    }
                }
            }
        }

        if results.is_empty()
            && let Some((path, reason)) = suspect
        {
            return Err(CoreError::Corruption {
                primary: path,
                backup: None,
                reason: format!("{suspects} unreadable workspace entries, first: {reason}"),
            });
        }
        Ok(results)
    }

    /// Best-effort extraction of the `repo` field from a file that failed
    /// full deserialization.
    fn salvage_repo_hint(&self, id: &str) -> Option<String> {
        let path = if self.file_path(id).exists() {
            self.file_path(id)
        } else {
            self.legacy_file_path(id)
        };
        let bytes = fs::read(path).ok()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        value.get("repo")?.as_str().map(str::to_string)
    }

    /// Atomically append a tab under the per-workspace lock: reload,
    /// dedupe on `session_name`, append, rename into place. Concurrent
    /// appends with distinct names both land; equal names collapse to one.
    pub fn append_open_tab(&self, id: &str, tab: TabInfo) -> Result<Workspace, CoreError> {
        paths::validate_workspace_id(id)?;
        let _lock = self.lock(id)?;

        let mut workspace = self
            .load(id)?
            .ok_or_else(|| CoreError::NotFound(format!("workspace {id}")))?
            .workspace;

        if workspace
            .open_tabs
            .iter()
            .any(|t| t.session_name == tab.session_name)
        {
            debug!(id = %id, session = %tab.session_name, "tab already recorded");
            return Ok(workspace);
        }

        workspace.open_tabs.push(tab);
        self.write_locked(id, &workspace)?;
        Ok(workspace)
    }

    /// Remove a tab by session name; clamps the active index. Unknown
    /// session names are a no-op.
    pub fn remove_open_tab(&self, id: &str, session_name: &str) -> Result<Workspace, CoreError> {
        paths::validate_workspace_id(id)?;
        let _lock = self.lock(id)?;

        let mut workspace = self
            .load(id)?
            .ok_or_else(|| CoreError::NotFound(format!("workspace {id}")))?
            .workspace;

        let before = workspace.open_tabs.len();
        workspace.open_tabs.retain(|t| t.session_name != session_name);
        if workspace.open_tabs.len() != before {
            workspace.active_tab_index = workspace
                .active_tab_index
                .min(workspace.open_tabs.len().saturating_sub(1));
            self.write_locked(id, &workspace)?;
        }
        Ok(workspace)
    }

    /// Persist the active tab selection, clamped to the tab list.
    pub fn set_active_tab(&self, id: &str, index: usize) -> Result<Workspace, CoreError> {
        paths::validate_workspace_id(id)?;
        let _lock = self.lock(id)?;

        let mut workspace = self
            .load(id)?
            .ok_or_else(|| CoreError::NotFound(format!("workspace {id}")))?
            .workspace;
        workspace.active_tab_index = index.min(workspace.open_tabs.len().saturating_sub(1));
        self.write_locked(id, &workspace)?;
        Ok(workspace)
    }

    /// Mark a workspace archived (or not), stamping `archived_at`.
    pub fn set_archived(&self, id: &str, archived: bool) -> Result<Workspace, CoreError> {
        paths::validate_workspace_id(id)?;
        let _lock = self.lock(id)?;

        let mut workspace = self
            .load(id)?
            .ok_or_else(|| CoreError::NotFound(format!("workspace {id}")))?
            .workspace;
        workspace.archived = archived;
        workspace.archived_at = archived.then(chrono::Utc::now);
        self.write_locked(id, &workspace)?;
        Ok(workspace)
    }

    /// Merge discovery output over stored metadata. Overwrites the
    /// archived flag with what discovery carries.
    pub fn upsert_from_discovery(&self, incoming: &Workspace) -> Result<Workspace, CoreError> {
        self.upsert(incoming, false)
    }

    /// Like `upsert_from_discovery`, but `archived` and `archived_at` stay
    /// as stored — discovery never resurrects an archived workspace.
    pub fn upsert_from_discovery_preserve_archived(
        &self,
        incoming: &Workspace,
    ) -> Result<Workspace, CoreError> {
        self.upsert(incoming, true)
    }

    fn upsert(&self, incoming: &Workspace, preserve_archived: bool) -> Result<Workspace, CoreError> {
        let id = self.validate_for_save(incoming)?;
        let _lock = self.lock(&id)?;

        let stored = self.load(&id)?.map(|l| l.workspace);
        let merged = merge_discovery(incoming, stored, preserve_archived);
        self.write_locked(&id, &merged)?;
        Ok(merged)
    }
}

fn merge_discovery(
    incoming: &Workspace,
    stored: Option<Workspace>,
    preserve_archived: bool,
) -> Workspace {
    let mut merged = incoming.clone();
    if let Some(stored) = stored {
        if merged.created.is_none() {
            merged.created = stored.created;
        }
        // An assistant the user already picked wins over whatever the
        // discovery pass carries.
        if !stored.assistant.trim().is_empty() {
            merged.assistant = stored.assistant.clone();
        }
        if merged.open_tabs.is_empty() {
            merged.open_tabs = stored.open_tabs.clone();
            merged.active_tab_index = stored.active_tab_index;
        }
        if merged.env.is_empty() {
            merged.env = stored.env.clone();
        }
        if merged.scripts == Default::default() {
            merged.scripts = stored.scripts.clone();
        }
        if preserve_archived {
            merged.archived = stored.archived;
            merged.archived_at = stored.archived_at;
        }
    }
    merged.apply_defaults();
    merged
}

fn read_workspace(path: &Path) -> Result<Option<Workspace>, CoreError> {
    match fs::read(path) {
        Ok(bytes) => {
            let mut ws: Workspace =
                serde_json::from_slice(&bytes).map_err(|e| CoreError::Corruption {
                    primary: path.to_path_buf(),
                    backup: None,
                    reason: e.to_string(),
                })?;
            ws.apply_defaults();
            Ok(Some(ws))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{ScriptMode, Workspace};
    use chrono::DateTime;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> WorkspaceStore {
        WorkspaceStore::new(dir.path().join("workspaces"))
    }

    fn sample_workspace() -> Workspace {
        let mut ws = Workspace::skeleton("ws-a", "main", "/repo", "/repo/ws-a");
        ws.created = DateTime::from_timestamp(1_700_000_000, 0);
        ws.assistant = "claude".into();
        ws
    }

    fn tab(session: &str) -> TabInfo {
        TabInfo {
            assistant: "claude".into(),
            name: session.into(),
            session_name: session.into(),
            status: "running".into(),
            created_at: DateTime::from_timestamp(1_700_000_100, 0),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ws = sample_workspace();

        let id = store.save(&ws).unwrap();
        assert_eq!(id, ws.id());
        let loaded = store.load(&id).unwrap().unwrap();
        assert!(loaded.warning.is_none());
        assert_eq!(loaded.workspace, ws);
    }

    #[test]
    fn save_rejects_empty_identity() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut ws = sample_workspace();
        ws.root = "  ".into();
        assert!(matches!(store.save(&ws), Err(CoreError::Usage(_))));
    }

    #[test]
    fn legacy_file_is_read_with_warning_and_migrates_on_save() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ws = sample_workspace();
        let id = ws.id();

        fs::create_dir_all(store.dir(&id)).unwrap();
        fs::write(
            store.legacy_file_path(&id),
            serde_json::to_vec(&ws).unwrap(),
        )
        .unwrap();

        let loaded = store.load(&id).unwrap().unwrap();
        assert!(loaded.warning.is_some());

        store.save(&loaded.workspace).unwrap();
        assert!(!store.legacy_file_path(&id).exists());
        assert!(store.file_path(&id).exists());
        assert!(store.load(&id).unwrap().unwrap().warning.is_none());
    }

    #[test]
    fn load_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let id = paths::workspace_id("/repo", "/repo/ws-a");
        fs::create_dir_all(store.dir(&id)).unwrap();
        fs::write(
            store.file_path(&id),
            r#"{"repo":"/repo","root":"/repo/ws-a"}"#,
        )
        .unwrap();

        let ws = store.load(&id).unwrap().unwrap().workspace;
        assert_eq!(ws.assistant, "claude");
        assert_eq!(ws.script_mode, ScriptMode::Nonconcurrent);
    }

    #[test]
    fn invalid_ids_are_rejected_everywhere() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for bad in ["../x", "a/b", "a\\b", ""] {
            assert!(store.load(bad).is_err(), "load accepted {bad:?}");
            assert!(store.delete(bad).is_err(), "delete accepted {bad:?}");
            assert!(
                store.append_open_tab(bad, tab("s")).is_err(),
                "append accepted {bad:?}"
            );
        }
    }

    #[test]
    fn corrupt_file_is_an_error_not_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let id = paths::workspace_id("/repo", "/repo/ws-a");
        fs::create_dir_all(store.dir(&id)).unwrap();
        fs::write(store.file_path(&id), "{broken").unwrap();

        assert!(matches!(
            store.load(&id),
            Err(CoreError::Corruption { .. })
        ));
        // The broken file must survive untouched.
        assert_eq!(fs::read(store.file_path(&id)).unwrap(), b"{broken");
    }

    #[test]
    fn concurrent_appends_with_distinct_sessions_keep_both() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        let ws = sample_workspace();
        let id = store.save(&ws).unwrap();

        let handles: Vec<_> = ["session-a", "session-b"]
            .into_iter()
            .map(|name| {
                let store = Arc::clone(&store);
                let id = id.clone();
                thread::spawn(move || store.append_open_tab(&id, tab(name)).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let tabs = store.load(&id).unwrap().unwrap().workspace.open_tabs;
        let mut names: Vec<_> = tabs.iter().map(|t| t.session_name.clone()).collect();
        names.sort();
        assert_eq!(names, ["session-a", "session-b"]);
    }

    #[test]
    fn concurrent_appends_with_equal_sessions_collapse_to_one() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        let ws = sample_workspace();
        let id = store.save(&ws).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                thread::spawn(move || store.append_open_tab(&id, tab("session-a")).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let tabs = store.load(&id).unwrap().unwrap().workspace.open_tabs;
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].session_name, "session-a");
    }

    #[test]
    fn remove_open_tab_clamps_active_index() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut ws = sample_workspace();
        ws.open_tabs = vec![tab("s-0"), tab("s-1")];
        ws.active_tab_index = 1;
        let id = store.save(&ws).unwrap();

        let after = store.remove_open_tab(&id, "s-1").unwrap();
        assert_eq!(after.open_tabs.len(), 1);
        assert_eq!(after.active_tab_index, 0);
    }

    #[test]
    fn load_metadata_for_merges_stored_over_skeleton() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut stored = sample_workspace();
        stored.assistant = "codex".into();
        stored.env.insert("KEY".into(), "v".into());
        store.save(&stored).unwrap();

        let skeleton = Workspace::skeleton("renamed", "feat/y", "/repo", "/repo/ws-a");
        let merged = store.load_metadata_for(&skeleton).unwrap().unwrap();
        assert_eq!(merged.name, "renamed");
        assert_eq!(merged.branch, "feat/y");
        assert_eq!(merged.assistant, "codex");
        assert_eq!(merged.env.get("KEY").map(String::as_str), Some("v"));
        assert_eq!(merged.created, stored.created);
    }

    #[test]
    fn load_metadata_for_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let skeleton = Workspace::skeleton("ws", "main", "/repo", "/repo/none");
        assert!(store.load_metadata_for(&skeleton).unwrap().is_none());
    }

    #[test]
    fn load_metadata_for_corrupt_file_errors_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let skeleton = Workspace::skeleton("ws", "main", "/repo", "/repo/ws-a");
        let id = skeleton.id();
        fs::create_dir_all(store.dir(&id)).unwrap();
        fs::write(store.file_path(&id), "{broken").unwrap();

        assert!(store.load_metadata_for(&skeleton).is_err());
        assert_eq!(fs::read(store.file_path(&id)).unwrap(), b"{broken");
    }

    #[test]
    fn load_metadata_for_falls_back_to_path_match() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        // Store under an id minted from different path spellings by writing
        // the directory by hand.
        let stored = sample_workspace();
        let other_id = "aaaabbbbccccdddd";
        fs::create_dir_all(store.dir(other_id)).unwrap();
        fs::write(
            store.file_path(other_id),
            serde_json::to_vec(&stored).unwrap(),
        )
        .unwrap();

        let skeleton = Workspace::skeleton("ws-a", "main", "/repo", "/repo/ws-a");
        let merged = store.load_metadata_for(&skeleton).unwrap().unwrap();
        assert_eq!(merged.created, stored.created);
    }

    #[test]
    fn list_by_repo_filters_archived_and_other_repos() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.save(&sample_workspace()).unwrap();

        let mut archived = Workspace::skeleton("ws-b", "main", "/repo", "/repo/ws-b");
        archived.archived = true;
        store.save(&archived).unwrap();

        let other = Workspace::skeleton("ws-c", "main", "/other", "/other/ws-c");
        store.save(&other).unwrap();

        let found = store.list_by_repo("/repo").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "ws-a");
    }

    #[test]
    fn list_by_repo_reports_corruption_when_nothing_readable_matches() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let id = paths::workspace_id("/repo", "/repo/ws-a");
        fs::create_dir_all(store.dir(&id)).unwrap();
        fs::write(store.file_path(&id), "{broken").unwrap();

        assert!(matches!(
            store.list_by_repo("/repo"),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn list_by_repo_ignores_unreadable_entries_for_other_repos() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&sample_workspace()).unwrap();

        // Unreadable entry that clearly belongs to another repo.
        let id = paths::workspace_id("/other", "/other/ws");
        fs::create_dir_all(store.dir(&id)).unwrap();
        fs::write(
            store.file_path(&id),
            r#"{"repo":"/other","root":42}"#,
        )
        .unwrap();

        let found = store.list_by_repo("/repo").unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn upsert_preserve_archived_keeps_archived_state() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ws = sample_workspace();
        let id = store.save(&ws).unwrap();
        store.set_archived(&id, true).unwrap();

        let rediscovered = Workspace::skeleton("ws-a", "main", "/repo", "/repo/ws-a");
        let merged = store
            .upsert_from_discovery_preserve_archived(&rediscovered)
            .unwrap();
        assert!(merged.archived);
        assert!(merged.archived_at.is_some());
    }

    #[test]
    fn upsert_keeps_existing_assistant_and_tabs() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut ws = sample_workspace();
        ws.assistant = "codex".into();
        ws.open_tabs = vec![tab("s-0")];
        store.save(&ws).unwrap();

        let mut rediscovered = Workspace::skeleton("ws-a", "main", "/repo", "/repo/ws-a");
        rediscovered.assistant = "claude".into();
        let merged = store.upsert_from_discovery(&rediscovered).unwrap();
        assert_eq!(merged.assistant, "codex");
        assert_eq!(merged.open_tabs.len(), 1);
    }

    #[test]
    fn delete_leaves_lock_file_outside_the_directory() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ws = sample_workspace();
        let id = store.save(&ws).unwrap();

        assert!(store.lock_path(&id).exists());
        store.delete(&id).unwrap();
        assert!(!store.dir(&id).exists());
        assert!(store.lock_path(&id).exists());
    }

    #[test]
    fn lock_many_sorts_and_acquires() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ids = vec!["bbbb".to_string(), "aaaa".to_string()];
        let locks = store.lock_many(&ids).unwrap();
        assert_eq!(locks.len(), 2);
        assert!(
            locks[0].path().to_string_lossy() < locks[1].path().to_string_lossy(),
            "locks must be acquired in sorted order"
        );
    }
}
