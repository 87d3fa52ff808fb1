//! Optional attempt record: `<root>/.amux/attempt.json` inside a worktree.
//!
//! Written by tracker integrations when a workspace was created for a
//! specific issue attempt; the core only reads and rewrites it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::time_flex;
use crate::error::CoreError;
use crate::fsutil;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AttemptRecord {
    pub attempt_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(with = "time_flex", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(with = "time_flex", skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Tracker-specific fields the core does not interpret but must not
    /// drop on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn attempt_path(root: &Path) -> PathBuf {
    root.join(".amux").join("attempt.json")
}

/// Read the attempt record for a worktree. Missing file is `Ok(None)`.
pub fn load(root: &Path) -> Result<Option<AttemptRecord>, CoreError> {
    let path = attempt_path(root);
    match fs::read(&path) {
        Ok(bytes) => {
            let record = serde_json::from_slice(&bytes).map_err(|e| CoreError::Corruption {
                primary: path,
                backup: None,
                reason: e.to_string(),
            })?;
            Ok(Some(record))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Io(e)),
    }
}

pub fn save(root: &Path, record: &AttemptRecord) -> Result<(), CoreError> {
    let path = attempt_path(root);
    let bytes = serde_json::to_vec_pretty(record).map_err(|e| CoreError::Corruption {
        primary: path.clone(),
        backup: None,
        reason: e.to_string(),
    })?;
    fsutil::write_atomic(&path, &bytes)?;
    Ok(())
}
