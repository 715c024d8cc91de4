//! Volume preservation around RUN.
//!
//! Image-declared volume directories are archived before a RUN and put
//! back afterwards, so whatever the command writes there is visible while
//! it runs but never reaches the next instruction or the committed layer.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use kiln_core::error::{BuildError, Result};

use crate::securepath::{container_path, is_at_or_below, resolve_in_root};

/// Set of preserved container paths, none below another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeSet(Vec<String>);

impl VolumeSet {
    /// Add `path`, dropping entries it subsumes.
    ///
    /// Returns false if an existing entry already covers it.
    pub fn add(&mut self, path: &str) -> bool {
        if self.covers(path) {
            return false;
        }
        self.0.retain(|existing| !is_at_or_below(existing, path));
        self.0.push(path.to_string());
        true
    }

    pub fn has(&self, path: &str) -> bool {
        self.0.iter().any(|p| p == path)
    }

    /// Whether `path` is an entry or lies below one.
    pub fn covers(&self, path: &str) -> bool {
        self.0.iter().any(|p| is_at_or_below(path, p))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Saved state of one preserved directory.
#[derive(Debug, Clone)]
pub struct VolumeCacheEntry {
    /// Canonical container path
    pub path: String,
    /// Archive of the directory's contents
    pub archive_file: PathBuf,
    pub saved_mode: u32,
    /// (uid, gid)
    pub saved_owner: (u32, u32),
    pub saved_mod_time: SystemTime,
}

/// Preserved volumes of one working container.
#[derive(Debug)]
pub struct VolumeCache {
    root: PathBuf,
    cache_dir: PathBuf,
    volumes: VolumeSet,
    entries: BTreeMap<String, VolumeCacheEntry>,
    counter: usize,
}

impl VolumeCache {
    /// `root` is the mounted container filesystem, `cache_dir` a private
    /// directory for archives.
    pub fn new(root: &Path, cache_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            volumes: VolumeSet::default(),
            entries: BTreeMap::new(),
            counter: 0,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &VolumeCacheEntry> {
        self.entries.values()
    }

    pub fn volumes(&self) -> &VolumeSet {
        &self.volumes
    }

    /// Start protecting `path`.
    pub fn preserve(&mut self, path: &str) -> Result<()> {
        tracing::debug!(path, "Preserving volume");
        let resolved = resolve_in_root(&self.root, path, true)?;
        let canonical = container_path(&self.root, &resolved)?;

        if self.volumes.covers(&canonical) {
            // Already inside a preserved tree; just make sure it exists.
            std::fs::create_dir_all(&resolved)?;
            return self.invalidate(&canonical);
        }

        if !resolved.exists() {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&resolved)?;
        }
        let meta = std::fs::metadata(&resolved)?;

        if !self.volumes.add(&canonical) {
            return Err(BuildError::VolumeCacheError(format!(
                "adding {} to the volume cache",
                canonical
            )));
        }

        self.counter += 1;
        let entry = VolumeCacheEntry {
            path: canonical.clone(),
            archive_file: self.cache_dir.join(format!("volume{}.tar", self.counter)),
            saved_mode: meta.mode() & 0o7777,
            saved_owner: (meta.uid(), meta.gid()),
            saved_mod_time: meta.modified()?,
        };
        self.entries.insert(canonical, entry);

        // Drop entries now subsumed by a broader volume.
        let stale: Vec<String> = self
            .entries
            .keys()
            .filter(|p| !self.volumes.has(p))
            .cloned()
            .collect();
        for path in stale {
            if let Some(entry) = self.entries.remove(&path) {
                tracing::debug!(path = %path, "Volume cache no longer needed");
                remove_if_exists(&entry.archive_file)?;
            }
        }
        Ok(())
    }

    /// Forget saved contents of every volume at or above `path`.
    ///
    /// The entry stays registered, so the next [`save_all`](Self::save_all)
    /// captures fresh contents.
    pub fn invalidate(&mut self, path: &str) -> Result<()> {
        for entry in self.entries.values() {
            if is_at_or_below(path, &entry.path) && entry.archive_file.exists() {
                tracing::debug!(volume = %entry.path, path, "Invalidated volume cache");
                remove_if_exists(&entry.archive_file)?;
            }
        }
        Ok(())
    }

    /// Archive every preserved directory that has no saved archive.
    pub fn save_all(&mut self) -> Result<()> {
        for entry in self.entries.values_mut() {
            if entry.archive_file.exists() {
                continue;
            }
            let dir = self.root.join(entry.path.trim_start_matches('/'));
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
            }
            let meta = std::fs::metadata(&dir)?;
            entry.saved_mode = meta.mode() & 0o7777;
            entry.saved_owner = (meta.uid(), meta.gid());
            entry.saved_mod_time = meta.modified()?;

            tracing::debug!(volume = %entry.path, archive = %entry.archive_file.display(), "Saving volume");
            archive_dir(&dir, &entry.archive_file)?;
        }
        Ok(())
    }

    /// Put every preserved directory back to its saved contents and
    /// attributes.
    pub fn restore_all(&self) -> Result<()> {
        for entry in self.entries.values() {
            let dir = self.root.join(entry.path.trim_start_matches('/'));
            tracing::debug!(volume = %entry.path, "Restoring volume");

            match std::fs::symlink_metadata(&dir) {
                Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&dir)?,
                Ok(_) => std::fs::remove_file(&dir)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            std::fs::create_dir_all(&dir)?;

            if entry.archive_file.exists() {
                let file = File::open(&entry.archive_file)?;
                let mut archive = tar::Archive::new(file);
                archive.set_preserve_permissions(true);
                archive.unpack(&dir).map_err(|e| {
                    BuildError::VolumeCacheError(format!(
                        "Failed to restore {} from {}: {}",
                        entry.path,
                        entry.archive_file.display(),
                        e
                    ))
                })?;
            }

            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(entry.saved_mode))?;
            let (uid, gid) = entry.saved_owner;
            std::os::unix::fs::chown(&dir, Some(uid), Some(gid))?;
            File::open(&dir)?.set_modified(entry.saved_mod_time)?;
        }
        Ok(())
    }
}

fn archive_dir(dir: &Path, output: &Path) -> Result<()> {
    let file = File::create(output)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir).map_err(|e| {
        BuildError::VolumeCacheError(format!("Failed to archive {}: {}", dir.display(), e))
    })?;
    builder
        .finish()
        .map_err(|e| BuildError::VolumeCacheError(format!("Failed to finalize archive: {}", e)))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
