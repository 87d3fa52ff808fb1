//! Workspace metadata model.
//!
//! A workspace is a working directory (usually a git worktree) with its own
//! metadata, scripts, env, and agent tabs. Identity is derived from the
//! canonicalized `(repo, root)` pair, never stored.

pub mod attempt;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths;

pub const DEFAULT_ASSISTANT: &str = "claude";

/// Where a workspace's working directory actually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Runtime {
    #[default]
    LocalWorktree,
    LocalCheckout,
    LocalDocker,
    CloudSandbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScriptMode {
    Concurrent,
    #[default]
    Nonconcurrent,
}

/// Workspace-level script overrides. Applied when the project-level
/// option is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceScripts {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

/// One agent session hosted inside a workspace. Durable across reattaches
/// until closed; `session_name` is unique within a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    #[serde(default)]
    pub assistant: String,
    #[serde(default)]
    pub name: String,
    pub session_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, with = "time_flex", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, alias = "base")]
    pub base_ref: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub root: String,
    #[serde(default, with = "time_flex", skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub assistant: String,
    #[serde(default)]
    pub scripts: WorkspaceScripts,
    #[serde(default)]
    pub script_mode: ScriptMode,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub open_tabs: Vec<TabInfo>,
    #[serde(default)]
    pub active_tab_index: usize,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, with = "time_flex", skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Workspace {
    /// A discovery skeleton: just the identity-bearing fields, everything
    /// else defaulted. Metadata is overlaid by `store::load_metadata_for`.
    pub fn skeleton(name: &str, branch: &str, repo: &str, root: &str) -> Self {
        Self {
            name: name.to_string(),
            branch: branch.to_string(),
            base_ref: String::new(),
            repo: repo.to_string(),
            root: root.to_string(),
            created: None,
            runtime: Runtime::default(),
            assistant: String::new(),
            scripts: WorkspaceScripts::default(),
            script_mode: ScriptMode::default(),
            env: BTreeMap::new(),
            open_tabs: Vec::new(),
            active_tab_index: 0,
            archived: false,
            archived_at: None,
        }
    }

    /// Stable identity: 16 hex chars of SHA-1 over the normalized
    /// `(repo, root)` pair.
    pub fn id(&self) -> String {
        paths::workspace_id(&self.repo, &self.root)
    }

    /// Fill the documented load-time defaults for fields a legacy file may
    /// carry as empty.
    pub fn apply_defaults(&mut self) {
        if self.assistant.trim().is_empty() {
            self.assistant = DEFAULT_ASSISTANT.to_string();
        }
    }

    /// Merge stored metadata into a discovered skeleton: the skeleton keeps
    /// its discovery-derived `name`, `branch`, `repo`, `root`; everything
    /// else comes from the stored workspace.
    pub fn overlay_stored(skeleton: &Workspace, stored: Workspace) -> Workspace {
        Workspace {
            name: skeleton.name.clone(),
            branch: skeleton.branch.clone(),
            repo: skeleton.repo.clone(),
            root: skeleton.root.clone(),
            ..stored
        }
    }
}

/// Sort for display: `created` descending (undated last), then name, then
/// root.
pub fn sort_workspaces(workspaces: &mut [Workspace]) {
    workspaces.sort_by(|a, b| {
        b.created
            .cmp(&a.created)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.root.cmp(&b.root))
    });
}

/// Timestamps on disk are RFC3339 strings, but files written by older
/// clients may carry unix epoch seconds.
pub(crate) mod time_flex {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TimeRepr {
        Rfc3339(String),
        EpochSeconds(i64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<TimeRepr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(TimeRepr::Rfc3339(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
            Some(TimeRepr::EpochSeconds(secs)) => DateTime::from_timestamp(secs, 0)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {secs}"))),
        }
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(t) => serializer.serialize_str(&t.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }
}
