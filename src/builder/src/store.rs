//! Image and container storage interface.

use std::path::PathBuf;

use async_trait::async_trait;
use kiln_core::error::Result;

use crate::image::{CommitOptions, ContainerRecord, HistoryEntry, ImageRecord, LayerRecord};

/// Storage for images, layers and working containers.
///
/// Implementations must be safe to share between the coordinator and its
/// stage runners.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Every stored image.
    async fn images(&self) -> Result<Vec<ImageRecord>>;

    /// Look up an image by ID, `sha256:` ID or name.
    async fn image(&self, id_or_name: &str) -> Result<Option<ImageRecord>>;

    async fn layer(&self, id: &str) -> Result<Option<LayerRecord>>;

    /// History of an image, oldest first.
    async fn history(&self, image_id: &str) -> Result<Vec<HistoryEntry>>;

    /// Create a read-write container from an image, or an empty one.
    async fn create_container(&self, image_id: Option<&str>) -> Result<ContainerRecord>;

    /// Root filesystem of a container.
    async fn mount(&self, container_id: &str) -> Result<PathBuf>;

    /// Private scratch directory belonging to a container.
    async fn container_dir(&self, container_id: &str) -> Result<PathBuf>;

    /// Directory kept across builds for a cache mount named `id`.
    async fn cache_dir(&self, id: &str) -> Result<PathBuf>;

    /// Commit a container's changes as a new image.
    async fn commit(&self, container_id: &str, options: &CommitOptions) -> Result<ImageRecord>;

    /// Give names to an image, taking them from any image that has them.
    async fn add_names(&self, image_id: &str, names: &[String]) -> Result<()>;

    async fn delete_image(&self, image_id: &str) -> Result<()>;

    async fn delete_container(&self, container_id: &str) -> Result<()>;
}

/// Normalize an image name: untagged names get `:latest`.
pub fn normalize_name(name: &str) -> String {
    if name.contains('@') {
        return name.to_string();
    }
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

/// A name without its tag or digest.
pub fn strip_tag(name: &str) -> &str {
    let name = name.split('@').next().unwrap_or(name);
    let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[slash..].rfind(':') {
        Some(colon) => &name[..slash + colon],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("app"), "app:latest");
        assert_eq!(normalize_name("app:v1"), "app:v1");
        assert_eq!(normalize_name("localhost:5000/app"), "localhost:5000/app:latest");
        assert_eq!(normalize_name("app@sha256:abc"), "app@sha256:abc");
    }

    #[test]
    fn test_strip_tag() {
        assert_eq!(strip_tag("app:v1"), "app");
        assert_eq!(strip_tag("localhost:5000/app:v1"), "localhost:5000/app");
        assert_eq!(strip_tag("localhost:5000/app"), "localhost:5000/app");
        assert_eq!(strip_tag("app@sha256:abc"), "app");
    }
}
