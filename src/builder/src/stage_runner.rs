//! Execution of a single stage.
//!
//! In layered mode every instruction either reuses a cached image or is
//! applied and committed, and the working container is rebased onto the
//! result. In single-layer mode instructions are applied in place and the
//! stage is committed once at the end.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use kiln_core::error::{BuildError, Result};
use kiln_core::{BuildOptions, MountSpec};
use tokio_util::sync::CancellationToken;

use crate::args::BuildArgSet;
use crate::cache::{CacheMatcher, CacheQuery};
use crate::container::WorkingContainer;
use crate::context::{BuildContext, ContextSource};
use crate::copier::{content_summary, copy_into, Copier, Source};
use crate::dispatch::{dispatch, DispatchContext, Effect};
use crate::history::{created_by, BASE_CREATED_BY};
use crate::image::{CommitOptions, HistoryEntry, ImageConfig, ImageRecord};
use crate::progress::Progress;
use crate::runtime::{ContainerRuntime, RunRequest};
use crate::securepath::{clean, container_path, resolve_in_root};
use crate::stage::{runs_remaining, CopySpec, MountKind, RunMount, Stage, Step};
use crate::state::BuildState;
use crate::store::ImageStore;
use crate::volumes::VolumeCache;

/// Collaborators shared by every stage of a build.
#[derive(Clone, Copy)]
pub struct StageEnv<'a> {
    pub options: &'a BuildOptions,
    pub store: &'a dyn ImageStore,
    pub runtime: &'a dyn ContainerRuntime,
    pub context: &'a BuildContext,
    pub cancel: &'a CancellationToken,
}

/// How the coordinator wants a stage built.
#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    pub index: usize,
    pub count: usize,
    /// Name for the stage's final image
    pub output: Option<String>,
    pub is_last: bool,
    /// A later stage builds FROM this stage
    pub image_needed: bool,
    /// A later `--from=` reads this stage's filesystem
    pub rootfs_needed: bool,
}

/// Result of a stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// `None` only in single-layer mode for stages nobody builds on
    pub image: Option<ImageRecord>,
    pub rootfs: Option<PathBuf>,
}

/// Runs the instructions of one stage.
pub struct StageRunner<'a> {
    env: StageEnv<'a>,
    stage: &'a Stage,
    /// Inherited ONBUILD triggers followed by the stage's own steps
    steps: Vec<Step>,
    plan: StagePlan,
    progress: Progress,
    cache: CacheMatcher,
    args: BuildArgSet,
    config: ImageConfig,
    container: Option<WorkingContainer>,
    volumes: Option<VolumeCache>,
    copier: Copier,
    /// Entries for instructions folded into the next commit
    pending_history: Vec<HistoryEntry>,
    image: Option<ImageRecord>,
}

/// Inputs of an instruction's effect, gathered before the cache lookup.
enum Prepared {
    Nothing,
    Copy {
        sources: Vec<Source>,
        context: BuildContext,
    },
    Mounts(Vec<MountSpec>),
}

fn no_container() -> BuildError {
    BuildError::Other("stage has no working container".to_string())
}

/// The path a bind mount exposes, confined to `context`.
fn bind_source(context: &BuildContext, source: Option<&str>) -> Result<ContextSource> {
    let cleaned = clean(source.unwrap_or("/"));
    if cleaned.trim_start_matches('/').is_empty() {
        return Ok(ContextSource {
            path: context.root().to_path_buf(),
            rel: PathBuf::new(),
        });
    }
    let mut found = context.resolve(&cleaned)?;
    if found.len() != 1 {
        return Err(BuildError::InvalidInstruction(format!(
            "mount source {} matches {} paths",
            cleaned,
            found.len()
        )));
    }
    Ok(found.remove(0))
}

impl<'a> StageRunner<'a> {
    pub fn new(env: StageEnv<'a>, stage: &'a Stage, plan: StagePlan) -> Result<Self> {
        let options = env.options;
        Ok(Self {
            progress: Progress::new(options.quiet, plan.index, plan.count),
            cache: CacheMatcher::new(options.use_cache(), options.cache_ttl_secs),
            args: BuildArgSet::new(&options.args),
            config: ImageConfig::default(),
            container: None,
            volumes: None,
            copier: Copier::new()?,
            pending_history: Vec::new(),
            image: None,
            steps: Vec::new(),
            env,
            stage,
            plan,
        })
    }

    /// Build the stage on top of `base` (`None` for scratch).
    pub async fn execute(
        mut self,
        base: Option<&ImageRecord>,
        state: &mut BuildState,
    ) -> Result<StageResult> {
        let stage = self.stage;
        let from_text = format!("FROM {}", stage.base);

        // Triggers registered by the base run first and are not inherited
        // by this stage's image.
        let mut config = base.map(|b| b.config.clone()).unwrap_or_default();
        let triggers = std::mem::take(&mut config.on_build);
        if !triggers.is_empty() {
            tracing::debug!(stage = %stage.name, count = triggers.len(), "Running ONBUILD triggers");
        }
        self.steps = triggers
            .iter()
            .map(|trigger| Step::from_line(trigger))
            .chain(stage.steps.iter().cloned().map(Ok))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.at_step(&stage.name, &from_text))?;
        self.config = config;

        let total = self.steps.len() + 1;
        self.progress.step(1, total, &from_text);

        let container = WorkingContainer::create(self.env.store, base)
            .await
            .map_err(|e| e.at_step(&stage.name, &from_text))?;
        tracing::debug!(stage = %stage.name, container = %container.id, "Prepared working container");
        state.containers.push(container.id.clone());
        self.container = Some(container);
        self.reset_volumes(0)
            .await
            .map_err(|e| e.at_step(&stage.name, &from_text))?;

        if self.steps.is_empty() {
            self.finish_empty(base)
                .await
                .map_err(|e| e.at_step(&stage.name, &from_text))?;
        }

        for index in 0..self.steps.len() {
            if self.env.cancel.is_cancelled() {
                return Err(BuildError::Canceled);
            }
            let step = self.steps[index].clone();
            self.progress.step(index + 2, total, &step.original);
            self.execute_step(index, &step, state)
                .await
                .map_err(|e| e.at_step(&stage.name, &step.original))?;
        }

        state
            .declared_args
            .extend(self.args.declared().map(str::to_string));

        let rootfs = if self.plan.rootfs_needed {
            self.container.as_ref().map(|c| c.rootfs.clone())
        } else {
            None
        };
        Ok(StageResult {
            image: self.image.take(),
            rootfs,
        })
    }

    async fn execute_step(
        &mut self,
        index: usize,
        step: &Step,
        state: &mut BuildState,
    ) -> Result<()> {
        let last_step = index + 1 == self.steps.len();

        let instruction = {
            let env = self.config.clone();
            let args = self.args.clone();
            step.resolve(&move |name: &str| {
                env.env_get(name)
                    .map(str::to_string)
                    .or_else(|| args.get(name).map(str::to_string))
            })?
        };
        let adds_layer = instruction.requires_layer();

        let mut ctx = DispatchContext {
            config: &mut self.config,
            args: &mut self.args,
            ignore_unrecognized: self.env.options.ignore_unrecognized_instructions,
        };
        let effect = dispatch(&mut ctx, instruction)?;

        // COPY/ADD content and bind-mounted content are summarized without
        // touching the container.
        let (prepared, summary) = match &effect {
            Effect::Copy { spec, add } => {
                let context = self.source_context(spec.from.as_deref(), state).await?;
                let sources = self.copier.sources(spec, *add, &context).await?;
                let summary = content_summary(&sources, &context)?;
                (Prepared::Copy { sources, context }, Some(summary))
            }
            Effect::Run { mounts, .. } if !mounts.is_empty() => {
                let (specs, summary) = self.prepare_mounts(mounts, state).await?;
                (Prepared::Mounts(specs), summary)
            }
            _ => (Prepared::Nothing, None),
        };
        let created_by = created_by(step, summary.as_deref(), &self.args, &self.config);

        if !self.env.options.layers {
            self.perform(effect, prepared, index).await?;
            if !last_step {
                let entry = HistoryEntry {
                    created: Some(self.timestamp()),
                    created_by,
                    author: self.config.author.clone().unwrap_or_default(),
                    empty_layer: true,
                    ..Default::default()
                };
                self.pending_history.push(entry);
            } else if self.plan.is_last || self.plan.image_needed {
                let squash = self.env.options.squash && self.plan.is_last;
                let image = self
                    .commit(created_by, false, self.plan.output.clone(), squash)
                    .await?;
                self.image = Some(image);
            }
            return Ok(());
        }

        let squash_final = self.env.options.squash && last_step && self.plan.is_last;
        if self.cache.is_caching() && !squash_final {
            let hit = {
                let container = self.container.as_ref().ok_or_else(no_container)?;
                let query = CacheQuery {
                    base_top_layer: container.top_layer.as_deref(),
                    base_history: container.history(),
                    base_diff_ids: container.diff_ids(),
                    created_by: &created_by,
                    adds_layer,
                };
                self.cache.find(self.env.store, &query).await?
            };

            if let Some(hit) = hit {
                self.progress.cache_hit(&hit.id);
                if last_step {
                    if let Some(output) = &self.plan.output {
                        self.env
                            .store
                            .add_names(&hit.id, std::slice::from_ref(output))
                            .await?;
                    }
                }
                self.image = Some(hit);
                if !last_step || self.plan.rootfs_needed {
                    self.rebase(index + 1, state).await?;
                }
                return Ok(());
            }
            self.cache.stop();
        }

        self.perform(effect, prepared, index).await?;
        let name = if last_step {
            self.plan.output.clone()
        } else {
            None
        };
        let image = self
            .commit(created_by, !adds_layer, name, squash_final)
            .await?;
        self.image = Some(image);
        if !last_step || self.plan.rootfs_needed {
            self.rebase(index + 1, state).await?;
        }
        Ok(())
    }

    /// Carry out the filesystem part of an instruction.
    async fn perform(&mut self, effect: Effect, prepared: Prepared, index: usize) -> Result<()> {
        match (effect, prepared) {
            (Effect::None, _) => Ok(()),
            (Effect::Run { argv, .. }, Prepared::Mounts(mounts)) => self.run(argv, mounts).await,
            (Effect::Run { argv, .. }, _) => self.run(argv, Vec::new()).await,
            (Effect::Copy { spec, add }, Prepared::Copy { sources, context }) => {
                self.copy(&sources, &spec, add, &context)
            }
            (Effect::Copy { .. }, _) => {
                Err(BuildError::Other("COPY sources were not resolved".into()))
            }
            (Effect::Volumes(paths), _) => {
                if runs_remaining(&self.steps, index + 1) {
                    if let Some(volumes) = self.volumes.as_mut() {
                        for path in paths {
                            volumes.preserve(&path)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Host directories for `RUN --mount`, plus a summary of bind-mounted
    /// content for the cache key.
    async fn prepare_mounts(
        &self,
        mounts: &[RunMount],
        state: &mut BuildState,
    ) -> Result<(Vec<MountSpec>, Option<String>)> {
        let workdir = self.config.workdir();
        let mut specs = Vec::new();
        let mut summaries = Vec::new();
        for mount in mounts {
            let destination = if mount.target.starts_with('/') {
                clean(&mount.target)
            } else {
                clean(&format!("{}/{}", workdir, mount.target))
            };
            let source = match mount.kind {
                MountKind::Bind => {
                    let context = self.source_context(mount.from.as_deref(), state).await?;
                    let source = bind_source(&context, mount.source.as_deref())?;
                    let path = source.path.clone();
                    summaries.push(content_summary(&[Source::Local(source)], &context)?);
                    path
                }
                MountKind::Cache => {
                    let id = mount.id.as_deref().unwrap_or(&destination);
                    self.env.store.cache_dir(id).await?
                }
            };
            tracing::debug!(source = %source.display(), destination = %destination, "Prepared RUN mount");
            specs.push(MountSpec {
                source,
                destination,
                read_only: mount.read_only,
            });
        }
        let summary = (!summaries.is_empty()).then(|| summaries.join(","));
        Ok((specs, summary))
    }

    async fn run(&mut self, argv: Vec<String>, mounts: Vec<MountSpec>) -> Result<()> {
        let container = self.container.as_ref().ok_or_else(no_container)?;
        let workdir = self.config.workdir().to_string();
        let host_workdir = resolve_in_root(&container.rootfs, &workdir, true)?;
        std::fs::create_dir_all(&host_workdir)?;

        if let Some(volumes) = self.volumes.as_mut() {
            volumes.save_all()?;
        }

        let request = RunRequest {
            container_id: container.id.clone(),
            rootfs: container.rootfs.clone(),
            args: argv.clone(),
            env: self.args.run_environment(&self.config),
            workdir,
            user: self.config.user.clone(),
            mounts: self
                .env
                .options
                .transient_mounts
                .iter()
                .cloned()
                .chain(mounts)
                .collect(),
            quiet: self.env.options.quiet,
        };
        let result = self.env.runtime.run(&request, self.env.cancel).await;

        // Volumes are put back whether or not the command succeeded.
        let restored = match &self.volumes {
            Some(volumes) => volumes.restore_all(),
            None => Ok(()),
        };

        let exit_code = match (result, restored) {
            (Ok(code), Ok(())) => code,
            (Err(e), Ok(())) => return Err(e),
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Err(restore)) => {
                tracing::warn!(error = %restore, "Failed to restore volumes after failed command");
                return Err(e);
            }
        };
        if exit_code != 0 {
            return Err(BuildError::RunFailed {
                command: argv.join(" "),
                exit_code,
            });
        }
        Ok(())
    }

    fn copy(
        &mut self,
        sources: &[Source],
        spec: &CopySpec,
        add: bool,
        context: &BuildContext,
    ) -> Result<()> {
        let container = self.container.as_ref().ok_or_else(no_container)?;
        let workdir = self.config.workdir();
        std::fs::create_dir_all(resolve_in_root(&container.rootfs, workdir, true)?)?;

        let dest = copy_into(sources, spec, add, context, &container.rootfs, workdir)?;
        if let Some(volumes) = self.volumes.as_mut() {
            let resolved = resolve_in_root(&container.rootfs, &dest, false)?;
            volumes.invalidate(&container_path(&container.rootfs, &resolved)?)?;
        }
        Ok(())
    }

    /// Where COPY/ADD sources and bind mounts come from: the build context,
    /// a finished stage's filesystem, or an image mounted for the purpose.
    async fn source_context(
        &self,
        from: Option<&str>,
        state: &mut BuildState,
    ) -> Result<BuildContext> {
        let Some(from) = from else {
            return Ok(self.env.context.clone());
        };
        let name = state.stage_name(from).to_string();

        if let Some(output) = state.outputs.get(&name) {
            return output
                .rootfs
                .as_deref()
                .map(BuildContext::for_rootfs)
                .ok_or(BuildError::StageNotBuilt(name));
        }
        if state.is_stage(&name) {
            return Err(BuildError::StageNotBuilt(name));
        }
        if let Some(container) = state.image_containers.get(&name) {
            return Ok(BuildContext::for_rootfs(&container.rootfs));
        }

        let image = self
            .env
            .store
            .image(&name)
            .await?
            .ok_or_else(|| BuildError::StageNotBuilt(name.clone()))?;
        let container = WorkingContainer::create(self.env.store, Some(&image)).await?;
        tracing::debug!(image = %name, container = %container.id, "Mounted image for --from");
        let context = BuildContext::for_rootfs(&container.rootfs);
        state.image_containers.insert(name, container);
        Ok(context)
    }

    /// Replace the working container with a fresh one on the current image.
    async fn rebase(&mut self, next_index: usize, state: &mut BuildState) -> Result<()> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| BuildError::Other("nothing to rebase onto".into()))?;
        let container = WorkingContainer::create(self.env.store, Some(image)).await?;
        tracing::debug!(image = %image.id, container = %container.id, "Rebased working container");
        state.containers.push(container.id.clone());
        self.container = Some(container);
        self.reset_volumes(next_index).await
    }

    /// Set up volume preservation for the current container if any RUN
    /// is left at or after `from`.
    async fn reset_volumes(&mut self, from: usize) -> Result<()> {
        self.volumes = None;
        if !runs_remaining(&self.steps, from) {
            return Ok(());
        }
        let container = self.container.as_ref().ok_or_else(no_container)?;
        let cache_dir = self.env.store.container_dir(&container.id).await?.join("volumes");
        std::fs::create_dir_all(&cache_dir)?;

        let mut volumes = VolumeCache::new(&container.rootfs, &cache_dir);
        for path in &self.config.volumes {
            volumes.preserve(path)?;
        }
        self.volumes = Some(volumes);
        Ok(())
    }

    /// A stage without instructions still yields an image.
    async fn finish_empty(&mut self, base: Option<&ImageRecord>) -> Result<()> {
        let options = self.env.options;
        let squash = options.squash && self.plan.is_last;
        let transform = base.is_none()
            || squash
            || !options.labels.is_empty()
            || !options.annotations.is_empty();

        if transform {
            let image = self
                .commit(
                    BASE_CREATED_BY.to_string(),
                    base.is_none(),
                    self.plan.output.clone(),
                    squash,
                )
                .await?;
            self.image = Some(image);
        } else if let Some(base) = base {
            self.progress.commit(self.plan.output.as_deref());
            if let Some(output) = &self.plan.output {
                self.env
                    .store
                    .add_names(&base.id, std::slice::from_ref(output))
                    .await?;
            }
            self.progress.image_id(&base.id);
            self.image = Some(base.clone());
        }
        Ok(())
    }

    async fn commit(
        &mut self,
        created_by: String,
        empty_layer: bool,
        name: Option<String>,
        squash: bool,
    ) -> Result<ImageRecord> {
        let created = self.timestamp();
        let container = self.container.as_ref().ok_or_else(no_container)?;
        self.progress.commit(name.as_deref());

        let mut config = self.config.clone();
        config
            .labels
            .extend(self.env.options.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut history = std::mem::take(&mut self.pending_history);
        history.push(HistoryEntry {
            created: Some(created),
            created_by,
            author: config.author.clone().unwrap_or_default(),
            comment: String::new(),
            empty_layer: empty_layer && !squash,
        });
        if squash {
            // Everything below the new entry is folded into its layer.
            let mut flattened: Vec<HistoryEntry> = container
                .history()
                .iter()
                .cloned()
                .map(|mut entry| {
                    entry.empty_layer = true;
                    entry
                })
                .collect();
            flattened.append(&mut history);
            history = flattened;
        }

        let options = CommitOptions {
            name,
            config,
            history,
            empty_layer: empty_layer && !squash,
            squash,
            created: Some(created),
            annotations: self.env.options.annotations.clone(),
        };
        let image = self.env.store.commit(&container.id, &options).await?;
        self.progress.image_id(&image.id);
        Ok(image)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.env.options.timestamp.unwrap_or_else(Utc::now)
    }
}
