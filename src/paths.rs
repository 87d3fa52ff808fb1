//! Path canonicalization and workspace identity.
//!
//! Two flavors of normalization exist on purpose. `normalize` is the lenient
//! form used for identity hashing and in-process keys: it cleans lexically
//! and resolves symlinks only when the path exists, leaving relative paths
//! relative otherwise. `canonicalize_strict` is the registry's form: it also
//! absolutizes against the current directory, so registry entries are stable
//! across CWD changes.

use std::path::{Path, PathBuf};

use normalize_path::NormalizePath;
use sha1::{Digest, Sha1};

use crate::error::CoreError;

/// Lexically clean a path: trim, collapse `.` and `..`.
fn clean(path: &str) -> PathBuf {
    let cleaned = Path::new(path.trim()).normalize();
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// Normalize a path: clean, then replace with the symlink-resolved form when
/// the path resolves. Pure over the current filesystem state; repeated calls
/// may differ if the filesystem changed underneath, and callers re-resolve
/// on lookup.
pub fn normalize(path: &str) -> String {
    if path.trim().is_empty() {
        return String::new();
    }
    let cleaned = clean(path);
    match dunce::canonicalize(&cleaned) {
        Ok(resolved) => resolved.to_string_lossy().into_owned(),
        Err(_) => cleaned.to_string_lossy().into_owned(),
    }
}

/// Strict canonicalization for registry entries: trim, clean, absolutize
/// against the CWD, resolve symlinks when possible, clean again.
/// Empty and whitespace-only input is a usage error.
pub fn canonicalize_strict(path: &str) -> Result<String, CoreError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(CoreError::usage("path must not be empty"));
    }

    let cleaned = clean(trimmed);
    let absolute = if cleaned.is_absolute() {
        cleaned
    } else {
        std::env::current_dir()
            .map_err(CoreError::Io)?
            .join(cleaned)
    };
    let resolved = dunce::canonicalize(&absolute).unwrap_or(absolute);
    Ok(resolved.normalize().to_string_lossy().into_owned())
}

/// Stable workspace identity: first 8 bytes of
/// `SHA1(normalize(repo) + "\n" + normalize(root))`, hex-encoded.
pub fn workspace_id(repo: &str, root: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(normalize(repo).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(root).as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// First 8 hex chars of a workspace id, used in tmux session names.
pub fn id_short(id: &str) -> &str {
    if id.len() >= 8 { &id[..8] } else { id }
}

/// Workspace ids double as directory names; reject anything that could
/// escape the metadata root.
pub fn validate_workspace_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::usage("workspace id must not be empty"));
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(CoreError::Usage(format!("invalid workspace id: {id}")));
    }
    Ok(())
}
