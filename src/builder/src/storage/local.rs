//! Directory-backed image store.
//!
//! Layout under the store root:
//!
//! ```text
//! index.json                      images, layers and containers
//! layers/<id>.tar                 uncompressed layer tarballs
//! containers/<id>/rootfs          working root filesystem
//! containers/<id>/snapshot.json   rootfs state at creation, for diffing
//! containers/<id>/userdata        scratch space owned by the container
//! cache/<sha256 of id>            contents of `RUN --mount=type=cache`
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::layer::{apply_layer, create_layer, sha256_bytes, DirSnapshot, LayerChanges};
use crate::image::{
    CommitOptions, ContainerRecord, HistoryEntry, ImageConfig, ImageRecord, LayerRecord,
};
use crate::store::{normalize_name, ImageStore};

const INDEX_FILE: &str = "index.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    #[serde(default)]
    images: BTreeMap<String, ImageRecord>,
    #[serde(default)]
    layers: BTreeMap<String, LayerRecord>,
    #[serde(default)]
    containers: BTreeMap<String, ContainerRecord>,
}

/// The serialized image configuration; its digest is the image ID.
#[derive(Serialize)]
struct ConfigBlob<'a> {
    created: DateTime<Utc>,
    config: &'a ImageConfig,
    history: &'a [HistoryEntry],
    rootfs: RootFs<'a>,
}

#[derive(Serialize)]
struct RootFs<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    diff_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    schema_version: u32,
    config: String,
    layers: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<&'a BTreeMap<String, String>>,
}

/// Image store kept in a local directory.
pub struct LocalStore {
    root: PathBuf,
    index: Arc<RwLock<StoreIndex>>,
}

impl LocalStore {
    /// Open (or create) a store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        for dir in [root.join("layers"), root.join("containers")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::StoreError(format!(
                    "Failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let index = load_index(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an image from the contents of a host directory.
    pub async fn import_dir(
        &self,
        source: &Path,
        name: &str,
        config: ImageConfig,
    ) -> Result<ImageRecord> {
        let container = self.create_container(None).await?;
        let rootfs = self.mount(&container.id).await?;
        copy_tree(source, &rootfs)?;

        let snapshot = DirSnapshot::capture(&rootfs)?;
        let mut content = String::new();
        for (path, entry) in &snapshot.entries {
            content.push_str(&format!("{}:{:?}:{:?}\n", path.display(), entry.kind, entry.content));
        }

        let options = CommitOptions {
            name: Some(name.to_string()),
            config,
            history: vec![HistoryEntry {
                created_by: format!(
                    "/bin/sh -c #(nop) ADD dir:{} in / ",
                    sha256_bytes(content.as_bytes())
                ),
                ..Default::default()
            }],
            ..Default::default()
        };
        let image = self.commit(&container.id, &options).await;
        self.delete_container(&container.id).await?;
        image
    }

    fn container_root(&self, id: &str) -> PathBuf {
        self.root.join("containers").join(id)
    }

    fn layer_path(&self, id: &str) -> PathBuf {
        self.root.join("layers").join(format!("{}.tar", id))
    }

    /// Persist the index (called with the write lock held).
    async fn save_index(&self, index: &StoreIndex) -> Result<()> {
        let data = serde_json::to_string_pretty(index)?;
        let index_path = self.root.join(INDEX_FILE);
        tokio::fs::write(&index_path, data).await.map_err(|e| {
            BuildError::StoreError(format!(
                "Failed to write store index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Store a layer for `changes`, reusing an identical existing one.
    fn write_layer(
        &self,
        index: &mut StoreIndex,
        parent: Option<&str>,
        rootfs: &Path,
        changes: &LayerChanges,
    ) -> Result<LayerRecord> {
        let staging = self
            .root
            .join("layers")
            .join(format!("staging-{}.tar", uuid::Uuid::new_v4().simple()));
        let info = create_layer(rootfs, changes, &staging)?;
        let id = sha256_bytes(format!("{} {}", parent.unwrap_or(""), info.diff_id).as_bytes());

        if let Some(existing) = index.layers.get(&id) {
            std::fs::remove_file(&staging)?;
            return Ok(existing.clone());
        }
        std::fs::rename(&staging, self.layer_path(&id))?;

        let layer = LayerRecord {
            id: id.clone(),
            parent: parent.map(str::to_string),
            diff_id: info.diff_id,
            size: info.size,
        };
        tracing::debug!(layer = %id, size = layer.size, "Stored layer");
        index.layers.insert(id, layer.clone());
        Ok(layer)
    }

    /// Remove layers no image or container refers to.
    fn collect_garbage(&self, index: &mut StoreIndex) -> Result<()> {
        let mut reachable = BTreeSet::new();
        let tops = index
            .images
            .values()
            .map(|i| i.top_layer.clone())
            .chain(index.containers.values().map(|c| c.top_layer.clone()));
        for top in tops.flatten() {
            let mut current = Some(top);
            while let Some(id) = current {
                if !reachable.insert(id.clone()) {
                    break;
                }
                current = index.layers.get(&id).and_then(|l| l.parent.clone());
            }
        }

        let unreachable: Vec<String> = index
            .layers
            .keys()
            .filter(|id| !reachable.contains(*id))
            .cloned()
            .collect();
        for id in unreachable {
            tracing::debug!(layer = %id, "Removing unreferenced layer");
            index.layers.remove(&id);
            remove_file_if_exists(&self.layer_path(&id))?;
        }
        Ok(())
    }
}

/// Layers from the bottom up to `top`.
fn layer_chain(index: &StoreIndex, top: Option<&str>) -> Result<Vec<LayerRecord>> {
    let mut chain = Vec::new();
    let mut current = top.map(str::to_string);
    while let Some(id) = current {
        let layer = index
            .layers
            .get(&id)
            .ok_or_else(|| BuildError::StoreError(format!("layer {} is missing", id)))?;
        current = layer.parent.clone();
        chain.push(layer.clone());
    }
    chain.reverse();
    Ok(chain)
}

fn find_image<'a>(index: &'a StoreIndex, id_or_name: &str) -> Option<&'a ImageRecord> {
    let id = id_or_name.strip_prefix("sha256:").unwrap_or(id_or_name);
    if let Some(image) = index.images.get(id) {
        return Some(image);
    }
    let normalized = normalize_name(id_or_name);
    index
        .images
        .values()
        .find(|image| image.names.iter().any(|n| n == id_or_name || *n == normalized))
}

/// Move `names` onto `image_id`, removing them from every other image.
fn assign_names(index: &mut StoreIndex, image_id: &str, names: &[String]) {
    for name in names.iter().map(|n| normalize_name(n)) {
        for image in index.images.values_mut() {
            if image.id != image_id {
                image.names.retain(|n| *n != name);
            }
        }
        if let Some(image) = index.images.get_mut(image_id) {
            if !image.names.contains(&name) {
                image.names.push(name);
            }
        }
    }
}

fn load_index(root: &Path) -> Result<StoreIndex> {
    let index_path = root.join(INDEX_FILE);
    if !index_path.exists() {
        return Ok(StoreIndex::default());
    }
    let data = std::fs::read_to_string(&index_path).map_err(|e| {
        BuildError::StoreError(format!(
            "Failed to read store index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    serde_json::from_str(&data)
        .map_err(|e| BuildError::StoreError(format!("Failed to parse store index: {}", e)))
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recursively copy a directory, keeping symlinks as symlinks.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(&src_path)?, &dst_path)?;
        } else if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[async_trait]
impl ImageStore for LocalStore {
    async fn images(&self) -> Result<Vec<ImageRecord>> {
        let index = self.index.read().await;
        Ok(index.images.values().cloned().collect())
    }

    async fn image(&self, id_or_name: &str) -> Result<Option<ImageRecord>> {
        let index = self.index.read().await;
        Ok(find_image(&index, id_or_name).cloned())
    }

    async fn layer(&self, id: &str) -> Result<Option<LayerRecord>> {
        let index = self.index.read().await;
        Ok(index.layers.get(id).cloned())
    }

    async fn history(&self, image_id: &str) -> Result<Vec<HistoryEntry>> {
        let index = self.index.read().await;
        find_image(&index, image_id)
            .map(|image| image.history.clone())
            .ok_or_else(|| BuildError::ImageNotFound(image_id.to_string()))
    }

    async fn create_container(&self, image_id: Option<&str>) -> Result<ContainerRecord> {
        let mut index = self.index.write().await;

        let image = match image_id {
            Some(id) => Some(
                find_image(&index, id)
                    .cloned()
                    .ok_or_else(|| BuildError::ImageNotFound(id.to_string()))?,
            ),
            None => None,
        };
        let top_layer = image.as_ref().and_then(|i| i.top_layer.clone());

        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.container_root(&id);
        let rootfs = dir.join("rootfs");
        std::fs::create_dir_all(&rootfs).map_err(|e| {
            BuildError::StoreError(format!(
                "Failed to create container root {}: {}",
                rootfs.display(),
                e
            ))
        })?;

        for layer in layer_chain(&index, top_layer.as_deref())? {
            apply_layer(&self.layer_path(&layer.id), &rootfs)?;
        }
        let snapshot = DirSnapshot::capture(&rootfs)?;
        std::fs::write(dir.join(SNAPSHOT_FILE), serde_json::to_vec(&snapshot)?)?;

        let record = ContainerRecord {
            id: id.clone(),
            image: image.map(|i| i.id),
            top_layer,
            created: Utc::now(),
        };
        tracing::debug!(container = %id, image = ?record.image, "Created container");
        index.containers.insert(id, record.clone());
        self.save_index(&index).await?;
        Ok(record)
    }

    async fn mount(&self, container_id: &str) -> Result<PathBuf> {
        let index = self.index.read().await;
        if !index.containers.contains_key(container_id) {
            return Err(BuildError::StoreError(format!(
                "container {} not found",
                container_id
            )));
        }
        Ok(self.container_root(container_id).join("rootfs"))
    }

    async fn container_dir(&self, container_id: &str) -> Result<PathBuf> {
        let index = self.index.read().await;
        if !index.containers.contains_key(container_id) {
            return Err(BuildError::StoreError(format!(
                "container {} not found",
                container_id
            )));
        }
        let dir = self.container_root(container_id).join("userdata");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn cache_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.root.join("cache").join(sha256_bytes(id.as_bytes()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn commit(&self, container_id: &str, options: &CommitOptions) -> Result<ImageRecord> {
        let mut index = self.index.write().await;

        let container = index
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| {
                BuildError::StoreError(format!("container {} not found", container_id))
            })?;
        let base = container
            .image
            .as_deref()
            .and_then(|id| index.images.get(id))
            .cloned();
        let rootfs = self.container_root(container_id).join("rootfs");

        let (top_layer, diff_ids, history) = if options.squash {
            let everything = DirSnapshot::default().diff(&DirSnapshot::capture(&rootfs)?);
            let layer = self.write_layer(&mut index, None, &rootfs, &everything)?;
            (Some(layer.id), vec![layer.diff_id], options.history.clone())
        } else {
            let mut diff_ids = base.as_ref().map(|b| b.diff_ids.clone()).unwrap_or_default();
            let mut history = base.as_ref().map(|b| b.history.clone()).unwrap_or_default();
            history.extend(options.history.iter().cloned());

            let top_layer = if options.empty_layer {
                container.top_layer.clone()
            } else {
                let data = std::fs::read(self.container_root(container_id).join(SNAPSHOT_FILE))?;
                let before: DirSnapshot = serde_json::from_slice(&data)?;
                let changes = before.diff(&DirSnapshot::capture(&rootfs)?);
                let layer = self.write_layer(
                    &mut index,
                    container.top_layer.as_deref(),
                    &rootfs,
                    &changes,
                )?;
                diff_ids.push(layer.diff_id);
                Some(layer.id)
            };
            (top_layer, diff_ids, history)
        };

        let created = options.created.unwrap_or_else(Utc::now);
        let blob = serde_json::to_vec(&ConfigBlob {
            created,
            config: &options.config,
            history: &history,
            rootfs: RootFs {
                kind: "layers",
                diff_ids: &diff_ids,
            },
        })?;
        let id = sha256_bytes(&blob);
        let manifest = serde_json::to_vec(&Manifest {
            schema_version: 2,
            config: format!("sha256:{}", id),
            layers: &diff_ids,
            annotations: (!options.annotations.is_empty()).then_some(&options.annotations),
        })?;
        let digest = format!("sha256:{}", sha256_bytes(&manifest));

        let names = index
            .images
            .get(&id)
            .map(|existing| existing.names.clone())
            .unwrap_or_default();
        let image = ImageRecord {
            id: id.clone(),
            names,
            top_layer,
            created,
            config: options.config.clone(),
            history,
            diff_ids,
            digest,
            annotations: options.annotations.clone(),
        };
        index.images.insert(id.clone(), image);
        if let Some(name) = &options.name {
            assign_names(&mut index, &id, std::slice::from_ref(name));
        }
        self.collect_garbage(&mut index)?;
        self.save_index(&index).await?;

        tracing::debug!(image = %id, container = %container_id, "Committed image");
        index
            .images
            .get(&id)
            .cloned()
            .ok_or_else(|| BuildError::StoreError(format!("image {} vanished after commit", id)))
    }

    async fn add_names(&self, image_id: &str, names: &[String]) -> Result<()> {
        let mut index = self.index.write().await;
        let id = find_image(&index, image_id)
            .map(|i| i.id.clone())
            .ok_or_else(|| BuildError::ImageNotFound(image_id.to_string()))?;
        assign_names(&mut index, &id, names);
        self.save_index(&index).await
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let id = find_image(&index, image_id)
            .map(|i| i.id.clone())
            .ok_or_else(|| BuildError::ImageNotFound(image_id.to_string()))?;
        index.images.remove(&id);
        self.collect_garbage(&mut index)?;
        tracing::debug!(image = %id, "Deleted image");
        self.save_index(&index).await
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        let mut index = self.index.write().await;
        if index.containers.remove(container_id).is_none() {
            return Err(BuildError::StoreError(format!(
                "container {} not found",
                container_id
            )));
        }
        let dir = self.container_root(container_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| {
                BuildError::StoreError(format!(
                    "Failed to remove container directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        self.collect_garbage(&mut index)?;
        tracing::debug!(container = %container_id, "Deleted container");
        self.save_index(&index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn store_with_base(tmp: &TempDir) -> (LocalStore, ImageRecord) {
        let base_dir = tmp.path().join("base");
        fs::create_dir_all(base_dir.join("etc")).unwrap();
        fs::write(base_dir.join("etc/os-release"), "ID=test\n").unwrap();
        let store = LocalStore::new(&tmp.path().join("store")).unwrap();
        let image = store
            .import_dir(&base_dir, "base", ImageConfig::default())
            .await
            .unwrap();
        (store, image)
    }

    #[tokio::test]
    async fn test_import_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let (store, image) = store_with_base(&tmp).await;
        assert_eq!(image.names, vec!["base:latest"]);
        assert_eq!(image.diff_ids.len(), 1);
        assert_eq!(image.history.len(), 1);
        assert!(image.digest.starts_with("sha256:"));

        for key in ["base", "base:latest", image.id.as_str()] {
            assert_eq!(store.image(key).await.unwrap().unwrap().id, image.id);
        }
        assert_eq!(
            store
                .image(&format!("sha256:{}", image.id))
                .await
                .unwrap()
                .unwrap()
                .id,
            image.id
        );
        assert!(store.image("missing").await.unwrap().is_none());
        // Import container is gone.
        assert_eq!(fs::read_dir(tmp.path().join("store/containers")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_container_sees_base_content() {
        let tmp = TempDir::new().unwrap();
        let (store, image) = store_with_base(&tmp).await;
        let container = store.create_container(Some(&image.id)).await.unwrap();
        assert_eq!(container.top_layer, image.top_layer);
        let rootfs = store.mount(&container.id).await.unwrap();
        assert_eq!(
            fs::read_to_string(rootfs.join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
    }

    #[tokio::test]
    async fn test_cache_dir_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let (store, _) = store_with_base(&tmp).await;
        let dir = store.cache_dir("/root/.cache").await.unwrap();
        fs::write(dir.join("hit"), "1").unwrap();
        assert_ne!(store.cache_dir("other").await.unwrap(), dir);

        let reopened = LocalStore::new(&tmp.path().join("store")).unwrap();
        let again = reopened.cache_dir("/root/.cache").await.unwrap();
        assert_eq!(again, dir);
        assert!(again.join("hit").is_file());
    }

    #[tokio::test]
    async fn test_commit_layer_with_deletion() {
        let tmp = TempDir::new().unwrap();
        let (store, base) = store_with_base(&tmp).await;
        let container = store.create_container(Some(&base.id)).await.unwrap();
        let rootfs = store.mount(&container.id).await.unwrap();
        fs::remove_file(rootfs.join("etc/os-release")).unwrap();
        fs::write(rootfs.join("hello"), "hi").unwrap();

        let entry = HistoryEntry {
            created_by: "/bin/sh -c change".to_string(),
            ..Default::default()
        };
        let image = store
            .commit(
                &container.id,
                &CommitOptions {
                    history: vec![entry.clone()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(image.history.len(), 2);
        assert_eq!(image.history[1], entry);
        assert_eq!(image.diff_ids.len(), 2);
        assert_eq!(image.diff_ids[0], base.diff_ids[0]);

        let layer = store.layer(image.top_layer.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(layer.parent, base.top_layer);

        let child = store.create_container(Some(&image.id)).await.unwrap();
        let child_root = store.mount(&child.id).await.unwrap();
        assert!(!child_root.join("etc/os-release").exists());
        assert_eq!(fs::read_to_string(child_root.join("hello")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_empty_layer_commit_keeps_top_layer() {
        let tmp = TempDir::new().unwrap();
        let (store, base) = store_with_base(&tmp).await;
        let container = store.create_container(Some(&base.id)).await.unwrap();
        let mut config = ImageConfig::default();
        config.env_set("A", "1");
        let image = store
            .commit(
                &container.id,
                &CommitOptions {
                    config,
                    empty_layer: true,
                    history: vec![HistoryEntry {
                        created_by: "/bin/sh -c #(nop) ENV A=1".to_string(),
                        empty_layer: true,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(image.top_layer, base.top_layer);
        assert_eq!(image.diff_ids, base.diff_ids);
        assert_ne!(image.id, base.id);
    }

    #[tokio::test]
    async fn test_squash_commit_single_layer() {
        let tmp = TempDir::new().unwrap();
        let (store, base) = store_with_base(&tmp).await;
        let container = store.create_container(Some(&base.id)).await.unwrap();
        let rootfs = store.mount(&container.id).await.unwrap();
        fs::write(rootfs.join("extra"), "x").unwrap();
        let image = store
            .commit(
                &container.id,
                &CommitOptions {
                    squash: true,
                    history: vec![HistoryEntry {
                        created_by: "/bin/sh -c squashed".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(image.diff_ids.len(), 1);
        assert_eq!(image.history.len(), 1);
        let layer = store.layer(image.top_layer.as_deref().unwrap()).await.unwrap().unwrap();
        assert!(layer.parent.is_none());
    }

    #[tokio::test]
    async fn test_names_move_between_images() {
        let tmp = TempDir::new().unwrap();
        let (store, base) = store_with_base(&tmp).await;
        let container = store.create_container(Some(&base.id)).await.unwrap();
        let other = store
            .commit(
                &container.id,
                &CommitOptions {
                    empty_layer: true,
                    history: vec![HistoryEntry {
                        created_by: "x".to_string(),
                        empty_layer: true,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.add_names(&other.id, &["base".to_string()]).await.unwrap();
        assert!(store.image(&base.id).await.unwrap().unwrap().names.is_empty());
        assert_eq!(store.image("base").await.unwrap().unwrap().id, other.id);
    }

    #[tokio::test]
    async fn test_index_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let (store, base) = store_with_base(&tmp).await;
        drop(store);
        let reopened = LocalStore::new(&tmp.path().join("store")).unwrap();
        assert_eq!(reopened.image("base").await.unwrap().unwrap().id, base.id);
        assert_eq!(reopened.images().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_image_collects_layers() {
        let tmp = TempDir::new().unwrap();
        let (store, base) = store_with_base(&tmp).await;
        let layer_id = base.top_layer.clone().unwrap();
        store.delete_image(&base.id).await.unwrap();
        assert!(store.layer(&layer_id).await.unwrap().is_none());
        assert!(!store.layer_path(&layer_id).exists());
        assert!(matches!(
            store.delete_image(&base.id).await.unwrap_err(),
            BuildError::ImageNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_container_removes_rootfs() {
        let tmp = TempDir::new().unwrap();
        let (store, base) = store_with_base(&tmp).await;
        let container = store.create_container(Some(&base.id)).await.unwrap();
        let rootfs = store.mount(&container.id).await.unwrap();
        store.delete_container(&container.id).await.unwrap();
        assert!(!rootfs.exists());
        assert!(store.mount(&container.id).await.is_err());
    }
}
