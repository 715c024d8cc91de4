//! The container a stage applies its instructions to.

use std::path::PathBuf;

use kiln_core::error::Result;

use crate::image::{HistoryEntry, ImageRecord};
use crate::store::ImageStore;

/// A mounted read-write container and the image it was created from.
#[derive(Debug, Clone)]
pub struct WorkingContainer {
    pub id: String,
    /// Mounted root filesystem
    pub rootfs: PathBuf,
    pub from_image: Option<ImageRecord>,
    pub top_layer: Option<String>,
}

impl WorkingContainer {
    /// Create and mount a container from `image` (scratch when `None`).
    pub async fn create(store: &dyn ImageStore, image: Option<&ImageRecord>) -> Result<Self> {
        let record = store.create_container(image.map(|i| i.id.as_str())).await?;
        let rootfs = store.mount(&record.id).await?;
        Ok(Self {
            id: record.id,
            rootfs,
            from_image: image.cloned(),
            top_layer: record.top_layer,
        })
    }

    /// History of the image the container was created from.
    pub fn history(&self) -> &[HistoryEntry] {
        self.from_image
            .as_ref()
            .map(|i| i.history.as_slice())
            .unwrap_or(&[])
    }

    pub fn diff_ids(&self) -> &[String] {
        self.from_image
            .as_ref()
            .map(|i| i.diff_ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn image_id(&self) -> Option<&str> {
        self.from_image.as_ref().map(|i| i.id.as_str())
    }
}
