//! Image, layer and container records exchanged with the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default shell for shell-form RUN/CMD/ENTRYPOINT.
pub const DEFAULT_SHELL: [&str; 2] = ["/bin/sh", "-c"];

/// One OCI history entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// HEALTHCHECK settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    /// `["NONE"]`, `["CMD", ...]` or `["CMD-SHELL", cmd]`
    pub test: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Runtime configuration carried by an image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// `KEY=VALUE` entries, in definition order
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub volumes: BTreeSet<String>,
    pub exposed_ports: BTreeSet<String>,
    pub shell: Option<Vec<String>>,
    pub stop_signal: Option<String>,
    pub on_build: Vec<String>,
    pub healthcheck: Option<HealthCheck>,
    pub author: Option<String>,
}

impl ImageConfig {
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Set or replace an environment variable, keeping its position.
    pub fn env_set(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        match self
            .env
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k) == Some(key))
        {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }

    /// Working directory, `/` when unset.
    pub fn workdir(&self) -> &str {
        self.working_dir.as_deref().unwrap_or("/")
    }

    pub fn shell(&self) -> Vec<String> {
        self.shell
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELL.iter().map(|s| s.to_string()).collect())
    }
}

/// A committed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Hex sha256 of the image config
    pub id: String,
    pub names: Vec<String>,
    /// Topmost filesystem layer; `None` for images without layers
    pub top_layer: Option<String>,
    pub created: DateTime<Utc>,
    pub config: ImageConfig,
    pub history: Vec<HistoryEntry>,
    /// `sha256:<hex>` of each uncompressed layer, bottom first
    pub diff_ids: Vec<String>,
    /// `sha256:<hex>` of the manifest
    pub digest: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A filesystem layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: String,
    pub parent: Option<String>,
    pub diff_id: String,
    pub size: u64,
}

/// A read-write container created from an image (or from nothing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub image: Option<String>,
    pub top_layer: Option<String>,
    pub created: DateTime<Utc>,
}

/// Options for [`crate::store::ImageStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Name to give the new image; moved off any image that has it
    pub name: Option<String>,
    pub config: ImageConfig,
    /// Entries appended to the base image's history, last one describes
    /// the new layer
    pub history: Vec<HistoryEntry>,
    /// Record metadata only, without a filesystem layer
    pub empty_layer: bool,
    /// Flatten the whole root filesystem into a single layer
    pub squash: bool,
    /// Image creation time; now when unset
    pub created: Option<DateTime<Utc>>,
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_set_replaces_in_place() {
        let mut config = ImageConfig::default();
        config.env_set("PATH", "/bin");
        config.env_set("HOME", "/root");
        config.env_set("PATH", "/usr/bin:/bin");
        assert_eq!(config.env, vec!["PATH=/usr/bin:/bin", "HOME=/root"]);
        assert_eq!(config.env_get("HOME"), Some("/root"));
        assert_eq!(config.env_get("HOM"), None);
    }

    #[test]
    fn test_workdir_and_shell_defaults() {
        let config = ImageConfig::default();
        assert_eq!(config.workdir(), "/");
        assert_eq!(config.shell(), vec!["/bin/sh", "-c"]);
    }

    #[test]
    fn test_history_entry_serialization_skips_defaults() {
        let entry = HistoryEntry {
            created_by: "/bin/sh -c #(nop) ENV A=1".to_string(),
            empty_layer: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"created_by":"/bin/sh -c #(nop) ENV A=1","empty_layer":true}"#
        );
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
