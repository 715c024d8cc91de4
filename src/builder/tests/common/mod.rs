//! Shared harness for builder integration tests.
//!
//! `ScriptRuntime` stands in for a container runtime. A RUN command is a
//! `&&`-separated list of:
//!
//! - `write <path> <text...>`: write a file, creating parent directories
//! - `rm <path>`: remove a file or directory tree
//! - `check <path>`: fail unless the path exists
//! - `missing <path>`: fail if the path exists
//! - `printenv <name> <path>`: write an environment value to a file
//! - `make`: concatenate the files under `/src` into `/src/out`
//! - `exit <code>`: stop with that exit code
//!
//! Paths below a mount destination resolve into the mount source.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kiln_build::coordinator::BuildOutcome;
use kiln_build::image::{ImageConfig, ImageRecord};
use kiln_build::runtime::{ContainerRuntime, RunRequest};
use kiln_build::stage::Stage;
use kiln_build::store::ImageStore;
use kiln_build::{BuildCoordinator, LocalStore};
use kiln_core::{BuildOptions, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct ScriptRuntime {
    calls: Mutex<Vec<RunRequest>>,
}

impl ScriptRuntime {
    pub fn calls(&self) -> Vec<RunRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn host_path(request: &RunRequest, path: &str) -> PathBuf {
        let full = if path.starts_with('/') {
            PathBuf::from(path)
        } else {
            Path::new(&request.workdir).join(path)
        };
        for mount in request.mounts.iter().rev() {
            if let Ok(rest) = full.strip_prefix(&mount.destination) {
                return mount.source.join(rest);
            }
        }
        request
            .rootfs
            .join(full.to_string_lossy().trim_start_matches('/'))
    }

    fn execute(request: &RunRequest, command: &str) -> std::io::Result<i32> {
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            ["write", path, text @ ..] => {
                let target = Self::host_path(request, path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, text.join(" "))?;
                Ok(0)
            }
            ["rm", path] => {
                let target = Self::host_path(request, path);
                if target.is_dir() {
                    std::fs::remove_dir_all(target)?;
                } else {
                    std::fs::remove_file(target)?;
                }
                Ok(0)
            }
            ["check", path] => Ok(if Self::host_path(request, path).exists() { 0 } else { 1 }),
            ["missing", path] => Ok(if Self::host_path(request, path).exists() { 1 } else { 0 }),
            ["printenv", name, path] => {
                let prefix = format!("{}=", name);
                let value = request
                    .env
                    .iter()
                    .find_map(|e| e.strip_prefix(&prefix))
                    .unwrap_or("");
                let target = Self::host_path(request, path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, value)?;
                Ok(0)
            }
            ["make"] => {
                let src = Self::host_path(request, "/src");
                let mut inputs: Vec<PathBuf> = std::fs::read_dir(&src)?
                    .map(|entry| entry.map(|e| e.path()))
                    .collect::<std::io::Result<_>>()?;
                inputs.retain(|p| p.is_file() && !p.ends_with("out"));
                inputs.sort();
                let mut out = String::new();
                for input in inputs {
                    out.push_str(&std::fs::read_to_string(input)?);
                }
                std::fs::write(src.join("out"), out)?;
                Ok(0)
            }
            ["exit", code] => Ok(code.parse().unwrap_or(1)),
            _ => Ok(127),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptRuntime {
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<i32> {
        self.calls.lock().unwrap().push(request.clone());
        if cancel.is_cancelled() {
            return Err(kiln_core::BuildError::Canceled);
        }

        let script = match request.args.as_slice() {
            [_, flag, script] if flag == "-c" => script.clone(),
            args => args.join(" "),
        };
        for command in script.split("&&") {
            let code = Self::execute(request, command.trim())?;
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }
}

/// A store, a runtime and a build context in one temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<LocalStore>,
    pub runtime: Arc<ScriptRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("context")).unwrap();
        let store = Arc::new(LocalStore::new(&dir.path().join("store")).unwrap());
        Self {
            dir,
            store,
            runtime: Arc::new(ScriptRuntime::default()),
        }
    }

    pub fn context_dir(&self) -> PathBuf {
        self.dir.path().join("context")
    }

    pub fn options(&self) -> BuildOptions {
        BuildOptions {
            context_dir: self.context_dir(),
            quiet: true,
            ..Default::default()
        }
    }

    pub fn write_context(&self, rel: &str, content: &str) {
        let path = self.context_dir().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Import a base image containing `files`.
    pub async fn base_image(&self, name: &str, files: &[(&str, &str)]) -> ImageRecord {
        self.base_image_with(name, files, ImageConfig::default()).await
    }

    pub async fn base_image_with(
        &self,
        name: &str,
        files: &[(&str, &str)],
        config: ImageConfig,
    ) -> ImageRecord {
        let source = TempDir::new().unwrap();
        for (path, content) in files {
            let target = source.path().join(path.trim_start_matches('/'));
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::write(target, content).unwrap();
        }
        self.store
            .import_dir(source.path(), name, config)
            .await
            .unwrap()
    }

    pub async fn build(&self, options: BuildOptions, stages: &[Stage]) -> Result<BuildOutcome> {
        let coordinator =
            BuildCoordinator::new(options, self.store.clone(), self.runtime.clone())?;
        coordinator.build(stages, &CancellationToken::new()).await
    }

    pub async fn image(&self, id: &str) -> ImageRecord {
        self.store.image(id).await.unwrap().unwrap()
    }

    /// Read a file from an image's filesystem.
    pub async fn read_image_file(&self, image_id: &str, path: &str) -> Option<String> {
        let container = self.store.create_container(Some(image_id)).await.unwrap();
        let rootfs = self.store.mount(&container.id).await.unwrap();
        let content = std::fs::read_to_string(rootfs.join(path.trim_start_matches('/'))).ok();
        self.store.delete_container(&container.id).await.unwrap();
        content
    }

    /// Whether a directory exists in an image's filesystem.
    pub async fn image_has_dir(&self, image_id: &str, path: &str) -> bool {
        let container = self.store.create_container(Some(image_id)).await.unwrap();
        let rootfs = self.store.mount(&container.id).await.unwrap();
        let found = rootfs.join(path.trim_start_matches('/')).is_dir();
        self.store.delete_container(&container.id).await.unwrap();
        found
    }

    /// Containers the store still knows about.
    pub fn container_dirs(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("store").join("containers"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Route builder logs to the test output; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn stage(position: usize, base: &str, alias: Option<&str>, lines: &[&str]) -> Stage {
    Stage::from_lines(position, base, alias, lines).unwrap()
}
