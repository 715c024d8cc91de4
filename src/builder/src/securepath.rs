//! Path resolution confined to a root directory.
//!
//! Paths are walked one component at a time as if the root were `/`:
//! `..` stops at the root, absolute symlink targets restart from the root
//! and relative targets continue from the link's directory. Nothing the
//! walk produces can name a location outside the root.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};

/// Maximum symlinks followed while resolving one path.
pub const MAX_SYMLINKS: usize = 40;

/// Resolve `path` (absolute or relative to the root) inside `root`.
///
/// Symlinks are followed on every component, including the last. With
/// `create_parents`, missing intermediate directories are created with
/// mode 0755; a missing final component is returned unresolved.
pub fn resolve_in_root(root: &Path, path: &str, create_parents: bool) -> Result<PathBuf> {
    let mut pending: VecDeque<String> = components(path).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut followed = 0usize;

    while let Some(segment) = pending.pop_front() {
        if segment == ".." {
            resolved.pop();
            continue;
        }

        let candidate = join(root, &resolved).join(&segment);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                followed += 1;
                if followed > MAX_SYMLINKS {
                    return Err(BuildError::TooManySymlinks {
                        path: path.to_string(),
                    });
                }
                let target = std::fs::read_link(&candidate)?;
                let target = target.to_string_lossy();
                if target.starts_with('/') {
                    resolved.clear();
                }
                for part in components(&target).collect::<Vec<_>>().into_iter().rev() {
                    pending.push_front(part);
                }
            }
            Ok(meta) => {
                if !pending.is_empty() && !meta.is_dir() {
                    return Err(BuildError::ResolveError(format!(
                        "{}: {} is not a directory",
                        path,
                        candidate.display()
                    )));
                }
                resolved.push(segment);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if create_parents && !pending.is_empty() {
                    create_dir(&candidate)?;
                }
                resolved.push(segment);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(join(root, &resolved))
}

/// The root-relative form of a path produced by [`resolve_in_root`].
pub fn container_path(root: &Path, resolved: &Path) -> Result<String> {
    let rel = resolved.strip_prefix(root).map_err(|_| BuildError::PathEscape {
        path: resolved.display().to_string(),
        root: root.to_path_buf(),
    })?;
    Ok(format!("/{}", rel.display()))
}

/// Lexically normalize a container path; `..` stops at `/`.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for part in components(path) {
        if part == ".." {
            parts.pop();
        } else {
            parts.push(part);
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether `path` equals `base` or lies below it (both cleaned, absolute).
pub fn is_at_or_below(path: &str, base: &str) -> bool {
    base == "/" || path == base || path.starts_with(&format!("{}/", base))
}

fn components(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .map(str::to_string)
}

fn join(root: &Path, parts: &[String]) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in parts {
        out.push(part);
    }
    out
}

fn create_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    match std::fs::DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_plain_path() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("usr/bin")).unwrap();
        let resolved = resolve_in_root(tmp.path(), "/usr/bin/env", false).unwrap();
        assert_eq!(resolved, tmp.path().join("usr/bin/env"));
    }

    #[test]
    fn test_dotdot_stops_at_root() {
        let tmp = TempDir::new().unwrap();
        let resolved = resolve_in_root(tmp.path(), "../../../etc/passwd", false).unwrap();
        assert_eq!(resolved, tmp.path().join("etc/passwd"));
    }

    #[test]
    fn test_absolute_symlink_stays_inside() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("real")).unwrap();
        symlink("/etc", tmp.path().join("real/link")).unwrap();
        let resolved = resolve_in_root(tmp.path(), "/real/link/passwd", false).unwrap();
        assert_eq!(resolved, tmp.path().join("etc/passwd"));
    }

    #[test]
    fn test_relative_symlink_escape_is_clamped() {
        let tmp = TempDir::new().unwrap();
        symlink("../../../../tmp", tmp.path().join("up")).unwrap();
        let resolved = resolve_in_root(tmp.path(), "up/file", false).unwrap();
        assert_eq!(resolved, tmp.path().join("tmp/file"));
    }

    #[test]
    fn test_symlink_to_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("var/lib/data")).unwrap();
        symlink("var/lib/data", tmp.path().join("data")).unwrap();
        let resolved = resolve_in_root(tmp.path(), "/data", false).unwrap();
        assert_eq!(resolved, tmp.path().join("var/lib/data"));
    }

    #[test]
    fn test_create_parents() {
        let tmp = TempDir::new().unwrap();
        let resolved = resolve_in_root(tmp.path(), "/a/b/c.txt", true).unwrap();
        assert_eq!(resolved, tmp.path().join("a/b/c.txt"));
        assert!(tmp.path().join("a/b").is_dir());
        assert!(!resolved.exists());
    }

    #[test]
    fn test_file_as_directory_fails() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f"), "x").unwrap();
        assert!(resolve_in_root(tmp.path(), "/f/g", false).is_err());
    }

    fn chain(root: &Path, links: usize) {
        // l0 -> l1 -> ... -> l{links-1} -> target
        for i in 0..links {
            let next = if i + 1 == links {
                "target".to_string()
            } else {
                format!("l{}", i + 1)
            };
            symlink(next, root.join(format!("l{}", i))).unwrap();
        }
        fs::write(root.join("target"), "ok").unwrap();
    }

    #[test]
    fn test_symlink_chain_at_bound_resolves() {
        let tmp = TempDir::new().unwrap();
        chain(tmp.path(), MAX_SYMLINKS);
        let resolved = resolve_in_root(tmp.path(), "/l0", false).unwrap();
        assert_eq!(resolved, tmp.path().join("target"));
    }

    #[test]
    fn test_symlink_chain_over_bound_fails() {
        let tmp = TempDir::new().unwrap();
        chain(tmp.path(), MAX_SYMLINKS + 1);
        let err = resolve_in_root(tmp.path(), "/l0", false).unwrap_err();
        assert!(matches!(err, BuildError::TooManySymlinks { .. }));
    }

    #[test]
    fn test_symlink_loop_fails() {
        let tmp = TempDir::new().unwrap();
        symlink("loop", tmp.path().join("loop")).unwrap();
        let err = resolve_in_root(tmp.path(), "/loop/x", true).unwrap_err();
        assert!(matches!(err, BuildError::TooManySymlinks { .. }));
    }

    #[test]
    fn test_clean_and_containment() {
        assert_eq!(clean("/data/./a/../seed.txt"), "/data/seed.txt");
        assert_eq!(clean("../x"), "/x");
        assert!(is_at_or_below("/data/seed.txt", "/data"));
        assert!(is_at_or_below("/data", "/data"));
        assert!(!is_at_or_below("/database", "/data"));
    }

    #[test]
    fn test_container_path() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("var/lib");
        assert_eq!(container_path(tmp.path(), &p).unwrap(), "/var/lib");
        assert_eq!(container_path(tmp.path(), tmp.path()).unwrap(), "/");
    }
}
