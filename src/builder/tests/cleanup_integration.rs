//! Integration tests: errors raised while cleaning up after a build.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use common::{stage, Harness};
use kiln_build::image::{CommitOptions, ContainerRecord, HistoryEntry, ImageRecord, LayerRecord};
use kiln_build::store::ImageStore;
use kiln_build::{BuildCoordinator, LocalStore};
use kiln_core::{BuildError, BuildOptions, ErrorKind, Result};
use tokio_util::sync::CancellationToken;

/// A local store that refuses to delete containers.
struct StickyContainerStore {
    inner: Arc<LocalStore>,
}

#[async_trait]
impl ImageStore for StickyContainerStore {
    async fn images(&self) -> Result<Vec<ImageRecord>> {
        self.inner.images().await
    }

    async fn image(&self, id_or_name: &str) -> Result<Option<ImageRecord>> {
        self.inner.image(id_or_name).await
    }

    async fn layer(&self, id: &str) -> Result<Option<LayerRecord>> {
        self.inner.layer(id).await
    }

    async fn history(&self, image_id: &str) -> Result<Vec<HistoryEntry>> {
        self.inner.history(image_id).await
    }

    async fn create_container(&self, image_id: Option<&str>) -> Result<ContainerRecord> {
        self.inner.create_container(image_id).await
    }

    async fn mount(&self, container_id: &str) -> Result<PathBuf> {
        self.inner.mount(container_id).await
    }

    async fn container_dir(&self, container_id: &str) -> Result<PathBuf> {
        self.inner.container_dir(container_id).await
    }

    async fn cache_dir(&self, id: &str) -> Result<PathBuf> {
        self.inner.cache_dir(id).await
    }

    async fn commit(&self, container_id: &str, options: &CommitOptions) -> Result<ImageRecord> {
        self.inner.commit(container_id, options).await
    }

    async fn add_names(&self, image_id: &str, names: &[String]) -> Result<()> {
        self.inner.add_names(image_id, names).await
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        self.inner.delete_image(image_id).await
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        Err(BuildError::StoreError(format!(
            "container {} is busy",
            container_id
        )))
    }
}

async fn build_sticky(h: &Harness, options: BuildOptions, lines: &[&str]) -> Result<()> {
    let store = Arc::new(StickyContainerStore {
        inner: h.store.clone(),
    });
    let coordinator = BuildCoordinator::new(options, store, h.runtime.clone())?;
    coordinator
        .build(&[stage(0, "base", None, lines)], &CancellationToken::new())
        .await
        .map(|_| ())
}

#[tokio::test]
async fn test_cleanup_failure_after_successful_build() {
    let h = Harness::new();
    h.base_image("base", &[]).await;

    let err = build_sticky(&h, h.options(), &["RUN write /a x"])
        .await
        .unwrap_err();
    match &err {
        BuildError::CleanupFailed(messages) => {
            assert!(!messages.is_empty());
            assert!(messages.iter().all(|m| m.contains("is busy")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Cleanup);
}

#[tokio::test]
async fn test_cleanup_failure_keeps_build_error() {
    let h = Harness::new();
    h.base_image("base", &[]).await;

    let err = build_sticky(&h, h.options(), &["RUN exit 3"])
        .await
        .unwrap_err();
    match &err {
        BuildError::WithCleanup { cleanup, .. } => assert!(cleanup.contains("is busy")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        err.root_cause(),
        BuildError::RunFailed { exit_code: 3, .. }
    ));
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[tokio::test]
async fn test_kept_containers_skip_failing_cleanup() {
    let h = Harness::new();
    h.base_image("base", &[]).await;
    let mut options = h.options();
    options.remove_intermediate_ctrs = false;

    build_sticky(&h, options, &["RUN write /a x"]).await.unwrap();
}
