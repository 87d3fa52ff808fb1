//! Atomic file replacement shared by the registry and workspace store.
//!
//! Writers stage into a temp file in the destination directory and rename
//! into place; readers therefore always observe a complete file.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic_with_backup(path, bytes, None)
}

/// Write `bytes` to `path` atomically. On Windows, `backup` names the file
/// used for the rename dance; elsewhere it is ignored (callers maintain
/// durable backups themselves with `fs::copy`).
pub fn write_atomic_with_backup(
    path: &Path,
    bytes: &[u8],
    backup: Option<&Path>,
) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    replace_file(tmp, path, backup)
}

#[cfg(not(windows))]
fn replace_file(tmp: NamedTempFile, dst: &Path, _backup: Option<&Path>) -> io::Result<()> {
    // The temp file lives next to the destination, so this rename never
    // crosses filesystems and is atomic.
    tmp.persist(dst).map(|_| ()).map_err(|e| e.error)
}

#[cfg(windows)]
fn replace_file(tmp: NamedTempFile, dst: &Path, backup: Option<&Path>) -> io::Result<()> {
    // Windows cannot rename over an existing file: move the current file to
    // the backup path, move the temp into place, and delete the backup on
    // success, restoring it if the final move fails.
    let owned;
    let backup_path = match backup {
        Some(b) => b,
        None => {
            owned = dst.with_extension("replace-bak");
            &owned
        }
    };

    let had_existing = dst.exists();
    if had_existing {
        fs::rename(dst, backup_path)?;
    }

    let (_file, tmp_path) = tmp.keep().map_err(|e| e.error)?;
    match fs::rename(&tmp_path, dst) {
        Ok(()) => {
            if had_existing {
                let _ = fs::remove_file(backup_path);
            }
            Ok(())
        }
        Err(e) => {
            if had_existing {
                let _ = fs::rename(backup_path, dst);
            }
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        fs::write(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"data").unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("out.json")]);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("out.json");
        write_atomic(&path, b"x").unwrap();
        assert!(path.exists());
    }
}
