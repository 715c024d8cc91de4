//! Multi-stage build coordination.
//!
//! The coordinator decides which stages to build, resolves each stage's
//! base, hands stages to a [`StageRunner`] in order and cleans up the
//! containers and intermediate images the build leaves behind.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use kiln_core::error::{BuildError, Result};
use kiln_core::BuildOptions;
use tokio_util::sync::CancellationToken;

use crate::args::unused_args;
use crate::context::BuildContext;
use crate::image::ImageRecord;
use crate::progress::short_id;
use crate::runtime::ContainerRuntime;
use crate::stage::Stage;
use crate::stage_runner::{StageEnv, StagePlan, StageRunner};
use crate::state::{BuildState, StageOutput};
use crate::store::{strip_tag, ImageStore};

/// Base name meaning "no base image".
pub const SCRATCH: &str = "scratch";

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub image_id: String,
    /// Manifest digest of the final image
    pub digest: String,
    /// `<output name without tag>@<digest>` when an output name was given
    pub canonical_ref: Option<String>,
}

/// Drives a whole build.
pub struct BuildCoordinator {
    options: BuildOptions,
    store: Arc<dyn ImageStore>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl BuildCoordinator {
    pub fn new(
        options: BuildOptions,
        store: Arc<dyn ImageStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            store,
            runtime,
        })
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build `stages` and return the final image.
    pub async fn build(&self, stages: &[Stage], cancel: &CancellationToken) -> Result<BuildOutcome> {
        let stages = self.select_stages(stages)?;
        let context = BuildContext::open(&self.options.context_dir)?;
        let mut state = BuildState::new(stages.iter().map(|s| s.name.clone()).collect());

        tracing::info!(
            stages = stages.len(),
            context = %self.options.context_dir.display(),
            layers = self.options.layers,
            "Starting build"
        );

        let result = self.build_stages(stages, &context, &mut state, cancel).await;
        let final_id = result.as_ref().ok().map(|image| image.id.clone());
        let cleanup = self.cleanup(&mut state, result.is_ok(), final_id.as_deref()).await;

        let (image, primary) = match result {
            Ok(image) => (Some(image), None),
            Err(e) => (None, Some(e)),
        };
        if let Some(err) = BuildError::merge_cleanup(primary, cleanup) {
            tracing::error!(error = %err, "Build failed");
            return Err(err);
        }
        let image = image.ok_or_else(|| BuildError::Other("build produced no image".into()))?;
        self.finish(image, &state).await
    }

    /// Stages up to and including the target.
    fn select_stages<'s>(&self, stages: &'s [Stage]) -> Result<&'s [Stage]> {
        if stages.is_empty() {
            return Err(BuildError::ConfigError("no stages to build".into()));
        }
        let Some(target) = self.options.target.as_deref() else {
            return Ok(stages);
        };
        let index = stages
            .iter()
            .position(|s| s.name == target)
            .ok_or_else(|| BuildError::ConfigError(format!("target stage {:?} not found", target)))?;
        Ok(&stages[..=index])
    }

    async fn build_stages(
        &self,
        stages: &[Stage],
        context: &BuildContext,
        state: &mut BuildState,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        let args = &self.options.args;
        let (base_map, rootfs_map) = dependents(stages, state, args);
        let needed = if self.options.skip_unused_stages {
            Some(needed_stages(stages, state, args))
        } else {
            None
        };

        let env = StageEnv {
            options: &self.options,
            store: self.store.as_ref(),
            runtime: self.runtime.as_ref(),
            context,
            cancel,
        };
        let last = stages.len() - 1;
        let mut final_image = None;

        for (index, stage) in stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(BuildError::Canceled);
            }
            if needed.as_ref().is_some_and(|n| !n.contains(&stage.name)) {
                tracing::info!(stage = %stage.name, "Skipping unused stage");
                continue;
            }

            let base = self
                .resolve_base(stage, state)
                .await
                .map_err(|e| e.at_step(&stage.name, format!("FROM {}", stage.base)))?;
            let plan = StagePlan {
                index,
                count: stages.len(),
                output: if index == last {
                    self.options.output.clone()
                } else {
                    None
                },
                is_last: index == last,
                image_needed: base_map.contains(&stage.name),
                rootfs_needed: rootfs_map.contains(&stage.name),
            };
            tracing::debug!(stage = %stage.name, position = index, base = %stage.base, "Building stage");

            let runner = StageRunner::new(env, stage, plan)?;
            let result = runner.execute(base.as_ref(), state).await?;
            let image_id = result.image.as_ref().map(|i| i.id.clone());

            if index == last {
                final_image = result.image;
            } else if let Some(id) = &image_id {
                if !self.options.layers {
                    // Single-layer intermediates are not cache entries.
                    if base_map.contains(&stage.name) || rootfs_map.contains(&stage.name) {
                        state.cleanup_images.push(id.clone());
                    } else {
                        self.store.delete_image(id).await?;
                    }
                }
            }

            state.register(
                &stage.name,
                stage.position,
                StageOutput {
                    image_id,
                    rootfs: result.rootfs,
                },
            );
        }

        final_image.ok_or_else(|| BuildError::Other("last stage produced no image".into()))
    }

    /// Base image for a stage: nothing for scratch, a prior stage's
    /// image, or an image from the store.
    async fn resolve_base(&self, stage: &Stage, state: &BuildState) -> Result<Option<ImageRecord>> {
        if stage.base == SCRATCH {
            return Ok(None);
        }
        if let Some(output) = state.outputs.get(&stage.base) {
            let id = output
                .image_id
                .as_deref()
                .ok_or_else(|| BuildError::StageNotBuilt(stage.base.clone()))?;
            return self
                .store
                .image(id)
                .await?
                .map(Some)
                .ok_or_else(|| BuildError::ImageNotFound(id.to_string()));
        }
        if state.is_stage(&stage.base) {
            return Err(BuildError::StageNotBuilt(stage.base.clone()));
        }
        self.store
            .image(&stage.base)
            .await?
            .map(Some)
            .ok_or_else(|| BuildError::ImageNotFound(stage.base.clone()))
    }

    /// Remove build containers and intermediate images.
    async fn cleanup(
        &self,
        state: &mut BuildState,
        succeeded: bool,
        final_id: Option<&str>,
    ) -> Vec<BuildError> {
        let mut errors = Vec::new();

        let remove = !succeeded
            || self.options.remove_intermediate_ctrs
            || self.options.force_rm_intermediate_ctrs;
        if remove {
            for id in state.containers.drain(..) {
                if let Err(e) = self.store.delete_container(&id).await {
                    tracing::warn!(container = %id, error = %e, "Failed to remove container");
                    errors.push(e);
                }
            }
        }
        for (name, container) in state.image_containers.drain() {
            if let Err(e) = self.store.delete_container(&container.id).await {
                tracing::warn!(image = %name, container = %container.id, error = %e, "Failed to remove container");
                errors.push(e);
            }
        }

        for id in std::mem::take(&mut state.cleanup_images) {
            if Some(id.as_str()) == final_id {
                continue;
            }
            if let Err(e) = self.store.delete_image(&id).await {
                tracing::warn!(image = %id, error = %e, "Failed to remove intermediate image");
                errors.push(e);
            }
        }
        errors
    }

    async fn finish(&self, image: ImageRecord, state: &BuildState) -> Result<BuildOutcome> {
        if !self.options.additional_tags.is_empty() {
            self.store
                .add_names(&image.id, &self.options.additional_tags)
                .await?;
            if !self.options.quiet {
                for tag in &self.options.additional_tags {
                    println!("Successfully tagged {}", tag);
                }
            }
        }

        match &self.options.iid_file {
            Some(path) => write_iid_file(path, &image.id)?,
            None => println!("{}", image.id),
        }

        let unused = unused_args(&self.options.args, &state.declared_args);
        if !unused.is_empty() {
            tracing::warn!(args = ?unused, "Build arguments were not consumed");
        }

        tracing::info!(image = %short_id(&image.id), digest = %image.digest, "Build complete");
        let canonical_ref = self
            .options
            .output
            .as_deref()
            .map(|output| format!("{}@{}", strip_tag(output), image.digest));
        Ok(BuildOutcome {
            image_id: image.id,
            digest: image.digest,
            canonical_ref,
        })
    }
}

/// Stages used as a base by a later stage, and stages whose filesystem
/// a later `--from=` or `RUN --mount` reads.
fn dependents(
    stages: &[Stage],
    state: &BuildState,
    args: &BTreeMap<String, String>,
) -> (HashSet<String>, HashSet<String>) {
    let mut base_map = HashSet::new();
    let mut rootfs_map = HashSet::new();
    for (index, stage) in stages.iter().enumerate() {
        if stages[..index].iter().any(|s| s.name == stage.base) {
            base_map.insert(stage.base.clone());
        }
        for reference in stage.from_references(args) {
            let name = state.stage_name(&reference);
            if stages[..index].iter().any(|s| s.name == name) {
                rootfs_map.insert(name.to_string());
            }
        }
    }
    (base_map, rootfs_map)
}

/// Names of the stages the last stage depends on, itself included.
fn needed_stages(
    stages: &[Stage],
    state: &BuildState,
    args: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    let mut needed = BTreeSet::new();
    let mut pending = vec![stages.len() - 1];
    while let Some(index) = pending.pop() {
        let stage = &stages[index];
        if !needed.insert(stage.name.clone()) {
            continue;
        }
        let froms = stage.from_references(args);
        let references = std::iter::once(stage.base.as_str())
            .chain(froms.iter().map(|r| state.stage_name(r)));
        for reference in references {
            if let Some(dep) = stages[..index].iter().position(|s| s.name == reference) {
                pending.push(dep);
            }
        }
    }
    needed
}

fn write_iid_file(path: &Path, image_id: &str) -> Result<()> {
    std::fs::write(path, format!("sha256:{}", image_id)).map_err(|e| {
        BuildError::Other(format!("failed to write image ID to {}: {}", path.display(), e))
    })
}
