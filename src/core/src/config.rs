use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// Build options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Default source root for COPY/ADD
    pub context_dir: PathBuf,

    /// Name given to the final image
    pub output: Option<String>,

    /// Extra names applied to the final image on success
    pub additional_tags: Vec<String>,

    /// Commit after every instruction and consult the cache
    pub layers: bool,

    /// Never reuse cached images (layered mode only)
    pub no_cache: bool,

    /// Produce the final image as a single layer
    pub squash: bool,

    /// User-supplied build arguments
    pub args: BTreeMap<String, String>,

    /// Labels applied at commit time
    pub labels: BTreeMap<String, String>,

    /// Annotations applied at commit time
    pub annotations: BTreeMap<String, String>,

    /// File that receives `sha256:<id>` of the final image
    pub iid_file: Option<PathBuf>,

    /// Skip unknown instructions instead of failing
    pub ignore_unrecognized_instructions: bool,

    /// Remove intermediate containers after a successful build
    pub remove_intermediate_ctrs: bool,

    /// Remove intermediate containers even after a failed build
    pub force_rm_intermediate_ctrs: bool,

    /// Stop after this stage
    pub target: Option<String>,

    /// Don't build stages the target does not depend on
    pub skip_unused_stages: bool,

    /// Suppress progress output
    pub quiet: bool,

    /// Fixed creation time for history entries and images
    pub timestamp: Option<DateTime<Utc>>,

    /// Ignore cached images older than this many seconds
    pub cache_ttl_secs: Option<u64>,

    /// Mounts visible to every RUN, never committed
    pub transient_mounts: Vec<MountSpec>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            context_dir: PathBuf::from("."),
            output: None,
            additional_tags: Vec::new(),
            layers: true,
            no_cache: false,
            squash: false,
            args: BTreeMap::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            iid_file: None,
            ignore_unrecognized_instructions: false,
            remove_intermediate_ctrs: true,
            force_rm_intermediate_ctrs: false,
            target: None,
            skip_unused_stages: true,
            quiet: false,
            timestamp: None,
            cache_ttl_secs: None,
            transient_mounts: Vec::new(),
        }
    }
}

impl BuildOptions {
    /// Parse options from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let options: BuildOptions = serde_yaml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a YAML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BuildError::ConfigError(format!(
                "Failed to read build options {}: {}",
                path.display(),
                e
            ))
        })?;

        let options: BuildOptions = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => serde_yaml::from_str(&text)?,
        };
        options.validate()?;
        Ok(options)
    }

    /// Reject option combinations that cannot be honored.
    pub fn validate(&self) -> Result<()> {
        if let Some(target) = &self.target {
            if target.trim().is_empty() {
                return Err(BuildError::ConfigError("target stage name is empty".into()));
            }
        }
        for mount in &self.transient_mounts {
            if !mount.destination.starts_with('/') {
                return Err(BuildError::ConfigError(format!(
                    "transient mount destination {:?} must be absolute",
                    mount.destination
                )));
            }
        }
        Ok(())
    }

    /// Whether the cache should be consulted at all.
    pub fn use_cache(&self) -> bool {
        self.layers && !self.no_cache
    }
}

/// A host directory bind-mounted into RUN containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path
    pub source: PathBuf,
    /// Absolute path inside the container
    pub destination: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}
