//! COPY and ADD.
//!
//! Resolves sources, computes the content summary that goes into history
//! (without touching the container) and performs the actual copy into a
//! container root with Docker's destination rules.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use kiln_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};

use crate::context::{BuildContext, ContextSource};
use crate::passwd::lookup_user;
use crate::securepath::{clean, resolve_in_root};
use crate::stage::CopySpec;
use crate::storage::layer::sha256_file;

/// A source ready to be summarized or copied.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// File, directory or symlink under a context or stage root
    Local(ContextSource),
    /// Downloaded ADD source
    Remote {
        url: String,
        file: PathBuf,
        name: String,
    },
}

/// Copies sources into container roots, caching downloads for a stage.
pub struct Copier {
    downloads: tempfile::TempDir,
    fetched: HashMap<String, PathBuf>,
    client: reqwest::Client,
}

impl Copier {
    pub fn new() -> Result<Self> {
        let downloads = tempfile::TempDir::new().map_err(|e| {
            BuildError::CopyError(format!("Failed to create download directory: {}", e))
        })?;
        Ok(Self {
            downloads,
            fetched: HashMap::new(),
            client: reqwest::Client::new(),
        })
    }

    /// Resolve every source of `spec` against `context`.
    pub async fn sources(
        &mut self,
        spec: &CopySpec,
        add: bool,
        context: &BuildContext,
    ) -> Result<Vec<Source>> {
        let mut out = Vec::new();
        for source in &spec.sources {
            if is_url(source) {
                if !add || spec.from.is_some() {
                    return Err(BuildError::InvalidInstruction(format!(
                        "source can't be a URL for COPY or --from: {}",
                        source
                    )));
                }
                let file = self.fetch(source).await?;
                out.push(Source::Remote {
                    url: source.clone(),
                    file,
                    name: url_basename(source),
                });
            } else {
                out.extend(context.resolve(source)?.into_iter().map(Source::Local));
            }
        }
        Ok(out)
    }

    async fn fetch(&mut self, url: &str) -> Result<PathBuf> {
        if let Some(path) = self.fetched.get(url) {
            return Ok(path.clone());
        }
        tracing::debug!(url, "Downloading ADD source");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BuildError::CopyError(format!("Failed to download {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(BuildError::DownloadError {
                url: url.to_string(),
                status_code: response.status().as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BuildError::CopyError(format!("Failed to read {}: {}", url, e)))?;

        let path = self
            .downloads
            .path()
            .join(format!("download{}", self.fetched.len()));
        tokio::fs::write(&path, &bytes).await?;
        self.fetched.insert(url.to_string(), path.clone());
        Ok(path)
    }
}

/// Summary of the content a COPY/ADD would add, without copying it.
///
/// `file:<sha256>` for one file, `dir:<sha256>` for one directory,
/// `multi:<sha256>` otherwise. The digest covers names, types,
/// permission bits, link targets and file contents.
pub fn content_summary(sources: &[Source], context: &BuildContext) -> Result<String> {
    let mut hasher = Sha256::new();
    for source in sources {
        match source {
            Source::Local(local) => {
                for entry in walk(&local.path, &local.rel, context)? {
                    hash_entry(&mut hasher, &entry)?;
                }
            }
            Source::Remote { name, file, .. } => {
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                hasher.update(sha256_file(file)?.as_bytes());
            }
        }
    }
    let digest = hex::encode(hasher.finalize());

    let prefix = match sources {
        [Source::Local(local)] if local.path.is_dir() => "dir",
        [_] => "file",
        _ => "multi",
    };
    Ok(format!("{}:{}", prefix, digest))
}

/// Copy `sources` into `rootfs` following `spec`.
///
/// Returns the cleaned container destination.
pub fn copy_into(
    sources: &[Source],
    spec: &CopySpec,
    add: bool,
    context: &BuildContext,
    rootfs: &Path,
    workdir: &str,
) -> Result<String> {
    let dest = if spec.dest.starts_with('/') {
        clean(&spec.dest)
    } else {
        clean(&format!("{}/{}", workdir, spec.dest))
    };
    let dest_exists_as_dir = resolve_in_root(rootfs, &dest, false)
        .map(|p| p.is_dir())
        .unwrap_or(false);
    let dest_is_dir = spec.dest.ends_with('/')
        || spec.dest == "."
        || sources.len() > 1
        || dest_exists_as_dir;

    let owner = match &spec.chown {
        Some(chown) => Some(lookup_user(rootfs, chown)?),
        None => None,
    };
    let attrs = Attributes {
        owner,
        chmod: spec.chmod,
    };

    tracing::debug!(dest = %dest, sources = sources.len(), "Copying into container");

    for source in sources {
        match source {
            Source::Local(local) => {
                let meta = std::fs::symlink_metadata(&local.path)?;
                if meta.is_dir() {
                    ensure_dir(rootfs, &dest, &attrs)?;
                    for entry in walk(&local.path, &local.rel, context)? {
                        let target = join_container(&dest, &entry.rel);
                        place(rootfs, &target, &entry, &attrs)?;
                    }
                } else if add && is_archive(&local.path) {
                    extract_archive(&local.path, rootfs, &dest, &attrs)?;
                } else {
                    let target = if dest_is_dir {
                        join_container(&dest, Path::new(&file_name(&local.path)))
                    } else {
                        dest.clone()
                    };
                    let entry = Entry {
                        rel: PathBuf::new(),
                        host: local.path.clone(),
                        meta,
                    };
                    place(rootfs, &target, &entry, &attrs)?;
                }
            }
            Source::Remote { file, name, .. } => {
                let target = if dest_is_dir {
                    join_container(&dest, Path::new(name))
                } else {
                    dest.clone()
                };
                let host = resolve_in_root(rootfs, &target, true)?;
                std::fs::copy(file, &host).map_err(|e| {
                    BuildError::CopyError(format!("Failed to write {}: {}", target, e))
                })?;
                std::fs::set_permissions(
                    &host,
                    std::fs::Permissions::from_mode(attrs.chmod.unwrap_or(0o600)),
                )?;
                attrs.apply_owner(&host)?;
            }
        }
    }
    Ok(dest)
}

struct Attributes {
    owner: Option<(u32, u32)>,
    chmod: Option<u32>,
}

impl Attributes {
    fn apply_owner(&self, path: &Path) -> Result<()> {
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
        }
        Ok(())
    }
}

/// One filesystem entry below a source.
#[derive(Debug)]
struct Entry {
    /// Path relative to the source; empty for the source itself
    rel: PathBuf,
    host: PathBuf,
    meta: std::fs::Metadata,
}

/// Entries of a source in sorted order, honoring the context's excludes.
/// A directory source yields its contents, not itself.
fn walk(path: &Path, context_rel: &Path, context: &BuildContext) -> Result<Vec<Entry>> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(vec![Entry {
            rel: PathBuf::from(file_name(path)),
            host: path.to_path_buf(),
            meta,
        }]);
    }
    let mut out = Vec::new();
    walk_dir(path, Path::new(""), context_rel, context, &mut out)?;
    Ok(out)
}

fn walk_dir(
    dir: &Path,
    rel: &Path,
    context_rel: &Path,
    context: &BuildContext,
    out: &mut Vec<Entry>,
) -> Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| {
            BuildError::CopyError(format!("Failed to read directory {}: {}", dir.display(), e))
        })?
        .collect::<std::io::Result<Vec<_>>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let child_rel = rel.join(child.file_name());
        let meta = std::fs::symlink_metadata(child.path())?;
        let is_dir = meta.is_dir();
        if context.is_excluded(&context_rel.join(&child_rel)) {
            // An excluded directory may still hold re-included entries.
            if is_dir && context.may_reinclude_below(&context_rel.join(&child_rel)) {
                walk_dir(&child.path(), &child_rel, context_rel, context, out)?;
            }
            continue;
        }
        out.push(Entry {
            rel: child_rel.clone(),
            host: child.path(),
            meta,
        });
        if is_dir {
            walk_dir(&child.path(), &child_rel, context_rel, context, out)?;
        }
    }
    Ok(())
}

fn hash_entry(hasher: &mut Sha256, entry: &Entry) -> Result<()> {
    let file_type = entry.meta.file_type();
    hasher.update(entry.rel.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(format!("{:o}", entry.meta.mode() & 0o7777).as_bytes());
    if file_type.is_symlink() {
        hasher.update(b"l");
        hasher.update(std::fs::read_link(&entry.host)?.to_string_lossy().as_bytes());
    } else if file_type.is_dir() {
        hasher.update(b"d");
    } else {
        hasher.update(b"f");
        hasher.update(sha256_file(&entry.host)?.as_bytes());
    }
    hasher.update([0u8]);
    Ok(())
}

/// Create `entry` at container path `target`.
fn place(rootfs: &Path, target: &str, entry: &Entry, attrs: &Attributes) -> Result<()> {
    let file_type = entry.meta.file_type();

    if file_type.is_symlink() {
        let host = resolve_parent(rootfs, target)?;
        remove_existing(&host)?;
        let link = std::fs::read_link(&entry.host)?;
        std::os::unix::fs::symlink(&link, &host)?;
        attrs.apply_owner(&host)?;
        return Ok(());
    }

    if file_type.is_dir() {
        let host = resolve_in_root(rootfs, target, true)?;
        if !host.is_dir() {
            remove_existing(&host)?;
            std::fs::create_dir(&host)?;
        }
        let mode = attrs.chmod.unwrap_or(entry.meta.mode() & 0o7777);
        std::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))?;
        attrs.apply_owner(&host)?;
        return Ok(());
    }

    let host = resolve_in_root(rootfs, target, true)?;
    if host.is_dir() {
        return Err(BuildError::CopyError(format!(
            "cannot overwrite directory {} with a file",
            target
        )));
    }
    std::fs::copy(&entry.host, &host).map_err(|e| {
        BuildError::CopyError(format!(
            "Failed to copy {} to {}: {}",
            entry.host.display(),
            target,
            e
        ))
    })?;
    let mode = attrs.chmod.unwrap_or(entry.meta.mode() & 0o7777);
    std::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))?;
    if let Ok(mtime) = entry.meta.modified() {
        File::options().write(true).open(&host)?.set_modified(mtime)?;
    }
    attrs.apply_owner(&host)?;
    Ok(())
}

/// Create the destination of a directory copy, so an empty source still
/// yields it.
fn ensure_dir(rootfs: &Path, dest: &str, attrs: &Attributes) -> Result<()> {
    let host = resolve_in_root(rootfs, dest, true)?;
    match std::fs::symlink_metadata(&host) {
        Ok(meta) if !meta.is_dir() => {
            return Err(BuildError::CopyError(format!(
                "cannot copy a directory onto file {}",
                dest
            )))
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => std::fs::create_dir_all(&host)?,
        Err(e) => return Err(e.into()),
    }
    if let Some(mode) = attrs.chmod {
        std::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))?;
    }
    attrs.apply_owner(&host)?;
    Ok(())
}

/// Securely resolve the parent of `target`, keeping the final name as is.
fn resolve_parent(rootfs: &Path, target: &str) -> Result<PathBuf> {
    let cleaned = clean(target);
    let (parent, name) = cleaned.rsplit_once('/').unwrap_or(("", cleaned.as_str()));
    if name.is_empty() {
        return Err(BuildError::CopyError(format!("invalid destination {:?}", target)));
    }
    let parent_host = resolve_in_root(rootfs, if parent.is_empty() { "/" } else { parent }, true)?;
    std::fs::create_dir_all(&parent_host)?;
    Ok(parent_host.join(name))
}

fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn extract_archive(archive: &Path, rootfs: &Path, dest: &str, attrs: &Attributes) -> Result<()> {
    let host_dest = resolve_in_root(rootfs, dest, true)?;
    std::fs::create_dir_all(&host_dest)?;

    let file = File::open(archive)?;
    let reader: Box<dyn Read> = if is_gzip(archive)? {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.unpack(&host_dest).map_err(|e| {
        BuildError::CopyError(format!(
            "Failed to extract {} to {}: {}",
            archive.display(),
            dest,
            e
        ))
    })?;
    attrs.apply_owner(&host_dest)?;
    Ok(())
}

fn is_archive(path: &Path) -> bool {
    let name = file_name(path);
    name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn url_basename(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    if name.is_empty() || name.contains(':') {
        "download".to_string()
    } else {
        name.to_string()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn join_container(base: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy();
    if rel.is_empty() {
        base.to_string()
    } else if base == "/" {
        format!("/{}", rel)
    } else {
        format!("{}/{}", base, rel)
    }
}
