//! Project registry: the persisted list of repository paths.
//!
//! One JSON file plus an adjacent `.bak` and `.lock`. All writes go through
//! an atomic replace; reads recover from the backup when the primary is
//! missing or corrupt. Entries are kept canonical and deduplicated.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::{fsutil, lockfile, paths};

pub const REGISTRY_FILE: &str = "projects.json";

/// A registered project as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectEntry {
    pub name: String,
    pub path: String,
}

impl ProjectEntry {
    pub fn from_path(path: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .map(OsStr::to_string_lossy)
            .map(|s| s.into_owned())
            .unwrap_or_else(|| path.to_string());
        Self {
            name,
            path: path.to_string(),
        }
    }
}

/// Accepted on read: `{"projects":[{name,path},…]}`, `{"projects":["p",…]}`,
/// or a bare `["p",…]`. Always written in the first shape.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRegistry {
    Wrapped { projects: Vec<StoredEntry> },
    Bare(Vec<StoredEntry>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Entry { path: String },
    Path(String),
}

impl StoredEntry {
    fn into_path(self) -> String {
        match self {
            StoredEntry::Entry { path } | StoredEntry::Path(path) => path,
        }
    }
}

/// Where a successful load got its data from. Writing operations use this
/// to decide whether the primary needs repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadOrigin {
    Primary,
    Empty,
    RecoveredFromBackup,
}

pub struct ProjectRegistry {
    path: PathBuf,
}

impl ProjectRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.amux/projects.json`.
    pub fn default_path() -> Result<PathBuf, CoreError> {
        let home = home::home_dir()
            .ok_or_else(|| CoreError::usage("cannot determine home directory"))?;
        Ok(home.join(".amux").join(REGISTRY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        append_extension(&self.path, "bak")
    }

    pub fn lock_path(&self) -> PathBuf {
        append_extension(&self.path, "lock")
    }

    /// Load the registry: canonicalized, deduplicated project paths.
    pub fn load(&self) -> Result<Vec<String>, CoreError> {
        let _lock = lockfile::lock_exclusive(&self.lock_path())?;
        let (paths, _) = self.load_locked()?;
        Ok(paths)
    }

    /// Persist `paths` (canonicalized and deduplicated) as the new registry.
    pub fn save(&self, paths: &[String]) -> Result<(), CoreError> {
        let canonical = canonicalize_all(paths.iter().cloned());
        let _lock = lockfile::lock_exclusive(&self.lock_path())?;
        self.persist(&canonical)
    }

    /// Add a project path. Idempotent under canonical identity; repairs a
    /// corrupt primary from the backup as a side effect.
    pub fn add_project(&self, path: &str) -> Result<(), CoreError> {
        let canonical = paths::canonicalize_strict(path)?;
        let _lock = lockfile::lock_exclusive(&self.lock_path())?;
        let (mut projects, origin) = self.load_locked()?;

        if projects.iter().any(|p| *p == canonical) {
            if origin == LoadOrigin::RecoveredFromBackup {
                self.persist(&projects)?;
            }
            debug!(path = %canonical, "project already registered");
            return Ok(());
        }

        projects.push(canonical);
        self.persist(&projects)
    }

    /// Remove a project path. Idempotent under canonical identity.
    pub fn remove_project(&self, path: &str) -> Result<(), CoreError> {
        let canonical = paths::canonicalize_strict(path)?;
        let _lock = lockfile::lock_exclusive(&self.lock_path())?;
        let (projects, origin) = self.load_locked()?;

        let remaining: Vec<String> = projects
            .iter()
            .filter(|p| **p != canonical)
            .cloned()
            .collect();

        if remaining.len() == projects.len() && origin != LoadOrigin::RecoveredFromBackup {
            debug!(path = %canonical, "project not registered");
            return Ok(());
        }
        self.persist(&remaining)
    }

    fn load_locked(&self) -> Result<(Vec<String>, LoadOrigin), CoreError> {
        let backup = self.backup_path();
        match fs::read(&self.path) {
            Ok(bytes) => match parse_registry(&bytes) {
                Ok(entries) => Ok((canonicalize_all(entries.into_iter()), LoadOrigin::Primary)),
                Err(parse_err) => self.recover_from_backup(&backup, &parse_err.to_string()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match read_backup(&backup)? {
                    Some(entries) => {
                        // The primary is gone but a backup survived; repair
                        // the primary right away so the next reader sees it.
                        let canonical = canonicalize_all(entries.into_iter());
                        warn!(backup = %backup.display(), "registry missing, restored from backup");
                        self.persist(&canonical)?;
                        Ok((canonical, LoadOrigin::Primary))
                    }
                    None => Ok((Vec::new(), LoadOrigin::Empty)),
                }
            }
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// The primary exists but does not parse. A valid backup is used
    /// without touching the still-broken primary; a writing operation that
    /// follows will repair it.
    fn recover_from_backup(
        &self,
        backup: &Path,
        parse_err: &str,
    ) -> Result<(Vec<String>, LoadOrigin), CoreError> {
        match read_backup(backup) {
            Ok(Some(entries)) => {
                warn!(
                    primary = %self.path.display(),
                    backup = %backup.display(),
                    "registry corrupt, using backup"
                );
                Ok((
                    canonicalize_all(entries.into_iter()),
                    LoadOrigin::RecoveredFromBackup,
                ))
            }
            Ok(None) => Err(CoreError::Corruption {
                primary: self.path.clone(),
                backup: None,
                reason: parse_err.to_string(),
            }),
            // The backup being unreadable must not mask the primary error.
            Err(backup_err) => Err(CoreError::Corruption {
                primary: self.path.clone(),
                backup: Some(backup.to_path_buf()),
                reason: format!("{parse_err}; backup unreadable: {backup_err}"),
            }),
        }
    }

    fn persist(&self, project_paths: &[String]) -> Result<(), CoreError> {
        let backup = self.backup_path();

        // Refresh the backup only from a primary that still parses; a
        // corrupt primary must never clobber the last good backup.
        if let Ok(bytes) = fs::read(&self.path)
            && parse_registry(&bytes).is_ok()
        {
            fs::copy(&self.path, &backup)?;
        }

        let entries: Vec<ProjectEntry> = project_paths
            .iter()
            .map(|p| ProjectEntry::from_path(p))
            .collect();
        let doc = json!({ "projects": entries });
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|e| CoreError::Corruption {
            primary: self.path.clone(),
            backup: None,
            reason: e.to_string(),
        })?;
        fsutil::write_atomic_with_backup(&self.path, &bytes, Some(&backup))?;
        Ok(())
    }
}

fn parse_registry(bytes: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let stored: StoredRegistry = serde_json::from_slice(bytes)?;
    let entries = match stored {
        StoredRegistry::Wrapped { projects } => projects,
        StoredRegistry::Bare(projects) => projects,
    };
    Ok(entries.into_iter().map(StoredEntry::into_path).collect())
}

fn read_backup(backup: &Path) -> Result<Option<Vec<String>>, CoreError> {
    match fs::read(backup) {
        Ok(bytes) => {
            let entries = parse_registry(&bytes).map_err(|e| CoreError::Corruption {
                primary: backup.to_path_buf(),
                backup: None,
                reason: e.to_string(),
            })?;
            Ok(Some(entries))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Io(e)),
    }
}

/// Canonicalize every entry (best-effort for paths that no longer resolve)
/// and deduplicate preserving first-seen order. Unresolvable entries keep
/// their cleaned form; empty entries are dropped.
fn canonicalize_all(entries: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in entries {
        let Ok(canonical) = paths::canonicalize_strict(&entry) else {
            continue;
        };
        if !out.contains(&canonical) {
            out.push(canonical);
        }
    }
    out
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}
