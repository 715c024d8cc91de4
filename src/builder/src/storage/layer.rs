//! Filesystem snapshots, layer tarballs and layer application.
//!
//! Layers are uncompressed tar archives. Deleted paths are recorded as
//! `.wh.<name>` whiteout entries ahead of the added and modified paths.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Type of a snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Content sha256 for files, link target for symlinks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// State of a directory tree, keyed by path relative to its root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirSnapshot {
    pub entries: BTreeMap<PathBuf, FileEntry>,
}

/// What changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerChanges {
    /// Added or modified paths, parents first
    pub changed: Vec<PathBuf>,
    /// Removed paths, excluding those under a removed or replaced parent
    pub deleted: Vec<PathBuf>,
}

impl LayerChanges {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

impl DirSnapshot {
    /// Take a snapshot of a directory tree.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Changes that turn this snapshot (before) into `after`.
    pub fn diff(&self, after: &DirSnapshot) -> LayerChanges {
        let changed = after
            .entries
            .iter()
            .filter(|(path, entry)| self.entries.get(*path) != Some(entry))
            .map(|(path, _)| path.clone())
            .collect();

        let mut deleted: Vec<PathBuf> = Vec::new();
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            let covered = path.ancestors().skip(1).any(|ancestor| {
                !ancestor.as_os_str().is_empty()
                    && after.entries.get(ancestor).map(|e| e.kind) != Some(EntryKind::Dir)
            });
            if !covered {
                deleted.push(path.clone());
            }
        }

        LayerChanges { changed, deleted }
    }
}

fn walk_dir(root: &Path, current: &Path, entries: &mut BTreeMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        BuildError::StoreError(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| BuildError::StoreError(format!("Failed to read directory entry: {}", e)))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                BuildError::StoreError(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            BuildError::StoreError(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;
        let file_type = metadata.file_type();

        let (kind, content) = if file_type.is_symlink() {
            let target = std::fs::read_link(&path)?;
            (EntryKind::Symlink, Some(target.to_string_lossy().into_owned()))
        } else if file_type.is_dir() {
            (EntryKind::Dir, None)
        } else if file_type.is_file() {
            (EntryKind::File, Some(sha256_file(&path)?))
        } else {
            (EntryKind::Other, None)
        };

        entries.insert(
            relative,
            FileEntry {
                kind,
                mode: metadata.mode() & 0o7777,
                uid: metadata.uid(),
                gid: metadata.gid(),
                size: if kind == EntryKind::File { metadata.len() } else { 0 },
                content,
            },
        );

        if kind == EntryKind::Dir {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

/// Information about a created layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub path: PathBuf,
    /// `sha256:<hex>` of the tarball
    pub diff_id: String,
    pub size: u64,
}

/// Write a layer tarball for `changes` in `rootfs`.
pub fn create_layer(rootfs: &Path, changes: &LayerChanges, output_path: &Path) -> Result<LayerInfo> {
    let file = File::create(output_path).map_err(|e| {
        BuildError::StoreError(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    for deleted in &changes.deleted {
        let name = deleted
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let whiteout = deleted
            .parent()
            .unwrap_or(Path::new(""))
            .join(format!("{}{}", WHITEOUT_PREFIX, name));

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &whiteout, std::io::empty())
            .map_err(|e| {
                BuildError::StoreError(format!(
                    "Failed to add whiteout for {} to layer: {}",
                    deleted.display(),
                    e
                ))
            })?;
    }

    for relative_path in &changes.changed {
        let full_path = rootfs.join(relative_path);
        builder
            .append_path_with_name(&full_path, relative_path)
            .map_err(|e| {
                BuildError::StoreError(format!(
                    "Failed to add {} to layer: {}",
                    relative_path.display(),
                    e
                ))
            })?;
    }

    builder
        .into_inner()
        .map_err(|e| BuildError::StoreError(format!("Failed to finalize layer: {}", e)))?;

    let digest = sha256_file(output_path)?;
    let size = std::fs::metadata(output_path).map(|m| m.len()).unwrap_or(0);

    Ok(LayerInfo {
        path: output_path.to_path_buf(),
        diff_id: format!("sha256:{}", digest),
        size,
    })
}

/// Apply a layer tarball on top of `rootfs`.
pub fn apply_layer(layer_path: &Path, rootfs: &Path) -> Result<()> {
    let file = File::open(layer_path).map_err(|e| {
        BuildError::StoreError(format!(
            "Failed to open layer {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let entries = archive
        .entries()
        .map_err(|e| BuildError::StoreError(format!("Failed to read layer: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| BuildError::StoreError(format!("Failed to read layer entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| BuildError::StoreError(format!("Invalid layer entry path: {}", e)))?
            .into_owned();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = rootfs.join(path.parent().unwrap_or(Path::new("")));

        if name == OPAQUE_WHITEOUT {
            if parent.is_dir() {
                for child in std::fs::read_dir(&parent)? {
                    remove_path(&child?.path())?;
                }
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&parent.join(hidden))?;
            continue;
        }

        let target = rootfs.join(&path);
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            let replacing_dir = existing.is_dir() && entry.header().entry_type() != tar::EntryType::Directory;
            if replacing_dir || !existing.is_dir() {
                remove_path(&target)?;
            }
        }

        entry.unpack_in(rootfs).map_err(|e| {
            BuildError::StoreError(format!(
                "Failed to unpack {} from layer: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        BuildError::StoreError(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
