//! Build-wide state shared between the coordinator and its stage runners.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::container::WorkingContainer;

/// What a finished stage left behind.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub image_id: Option<String>,
    /// Root filesystem kept for later `--from=` references
    pub rootfs: Option<PathBuf>,
}

/// Mutable state owned by the coordinator for one build.
#[derive(Debug, Default)]
pub struct BuildState {
    /// Stage names in build order
    pub stage_names: Vec<String>,
    /// Finished stages, keyed by name and by position
    pub outputs: HashMap<String, StageOutput>,
    /// Containers exposing images used only as COPY/ADD sources
    pub image_containers: HashMap<String, WorkingContainer>,
    /// Every working container created by a stage
    pub containers: Vec<String>,
    /// Intermediate images to delete once the build is over
    pub cleanup_images: Vec<String>,
    /// Argument names declared by any stage
    pub declared_args: BTreeSet<String>,
}

impl BuildState {
    pub fn new(stage_names: Vec<String>) -> Self {
        Self {
            stage_names,
            ..Default::default()
        }
    }

    /// Map a numeric stage reference to that stage's name.
    pub fn stage_name<'a>(&'a self, reference: &'a str) -> &'a str {
        match reference.parse::<usize>() {
            Ok(index) => self
                .stage_names
                .get(index)
                .map(String::as_str)
                .unwrap_or(reference),
            Err(_) => reference,
        }
    }

    pub fn is_stage(&self, name: &str) -> bool {
        self.stage_names.iter().any(|n| n == name)
    }

    /// Record a finished stage under its name and position.
    pub fn register(&mut self, name: &str, position: usize, output: StageOutput) {
        self.outputs.insert(position.to_string(), output.clone());
        self.outputs.insert(name.to_string(), output);
    }

    pub fn output(&self, reference: &str) -> Option<&StageOutput> {
        self.outputs.get(self.stage_name(reference))
    }
}
