//! Build context: the directory COPY/ADD sources are read from.
//!
//! Sources are resolved relative to the context root. A source whose
//! path climbs above the root is rejected, symlinks are confined to the
//! root, wildcards are expanded and `.dockerignore` patterns exclude
//! files from every lookup.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use kiln_core::error::{BuildError, Result};

use crate::securepath::{clean, resolve_in_root};

const IGNORE_FILE: &str = ".dockerignore";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One `.dockerignore` line.
#[derive(Debug, Clone)]
struct IgnorePattern {
    pattern: Pattern,
    negate: bool,
}

/// A resolved source.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSource {
    /// Location on the host
    pub path: PathBuf,
    /// Path relative to the context root, without leading `/`
    pub rel: PathBuf,
}

/// A directory sources are taken from, with its exclusion rules.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    excludes: Vec<IgnorePattern>,
}

impl BuildContext {
    /// Open a context directory, loading `.dockerignore` if present.
    pub fn open(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            BuildError::ConfigError(format!(
                "Build context {} is not accessible: {}",
                root.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(BuildError::ConfigError(format!(
                "Build context {} is not a directory",
                root.display()
            )));
        }

        let ignore_path = root.join(IGNORE_FILE);
        let lines = if ignore_path.is_file() {
            std::fs::read_to_string(&ignore_path)?
                .lines()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let mut context = Self {
            root,
            excludes: Vec::new(),
        };
        context.add_excludes(&lines)?;
        Ok(context)
    }

    /// A context over another filesystem root (a stage or image), with no
    /// exclusions.
    pub fn for_rootfs(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            excludes: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append exclusion patterns in `.dockerignore` syntax.
    pub fn add_excludes<S: AsRef<str>>(&mut self, lines: &[S]) -> Result<()> {
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negate, raw) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let normalized = clean(raw);
            let normalized = normalized.trim_start_matches('/');
            if normalized.is_empty() {
                continue;
            }
            let pattern = Pattern::new(normalized).map_err(|e| {
                BuildError::ConfigError(format!("invalid ignore pattern {:?}: {}", raw, e))
            })?;
            self.excludes.push(IgnorePattern { pattern, negate });
        }
        Ok(())
    }

    /// Whether a context-relative path is excluded.
    ///
    /// A pattern matching a directory excludes everything below it; the
    /// last matching pattern decides.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        let mut excluded = false;
        for ignore in &self.excludes {
            let matched = rel
                .ancestors()
                .filter(|a| !a.as_os_str().is_empty())
                .any(|a| ignore.pattern.matches_path_with(a, MATCH_OPTIONS));
            if matched {
                excluded = !ignore.negate;
            }
        }
        excluded
    }

    /// Whether some negated pattern could match a path below the excluded
    /// directory `rel`, so a walk has to look inside it.
    pub fn may_reinclude_below(&self, rel: &Path) -> bool {
        let dir: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        self.excludes
            .iter()
            .filter(|ignore| ignore.negate)
            .any(|ignore| {
                let parts: Vec<&str> = ignore.pattern.as_str().split('/').collect();
                if parts.contains(&"**") {
                    return true;
                }
                parts.len() > dir.len()
                    && parts.iter().zip(&dir).all(|(part, name)| {
                        Pattern::new(part)
                            .map(|p| p.matches_with(name, MATCH_OPTIONS))
                            .unwrap_or(false)
                    })
            })
    }

    /// Resolve one COPY/ADD source, expanding wildcards.
    pub fn resolve(&self, source: &str) -> Result<Vec<ContextSource>> {
        self.check_escape(source)?;
        let cleaned = clean(source);
        let rel = cleaned.trim_start_matches('/');

        if has_wildcard(rel) {
            return self.resolve_glob(source, rel);
        }

        let path = resolve_in_root(&self.root, rel, false)?;
        let rel_path = PathBuf::from(rel);
        if std::fs::symlink_metadata(&path).is_err() || (!rel.is_empty() && self.is_excluded(&rel_path)) {
            return Err(BuildError::SourceNotFound(format!(
                "{}: not found in {} or excluded",
                source,
                self.root.display()
            )));
        }
        Ok(vec![ContextSource {
            path,
            rel: rel_path,
        }])
    }

    fn resolve_glob(&self, source: &str, rel: &str) -> Result<Vec<ContextSource>> {
        let pattern = format!(
            "{}/{}",
            Pattern::escape(&self.root.to_string_lossy()),
            rel
        );
        let paths = glob::glob_with(&pattern, MATCH_OPTIONS).map_err(|e| {
            BuildError::InvalidInstruction(format!("invalid source pattern {:?}: {}", source, e))
        })?;

        let mut out = Vec::new();
        for entry in paths {
            let matched = entry.map_err(|e| BuildError::IoError(e.into()))?;
            let Ok(rel_match) = matched.strip_prefix(&self.root) else {
                continue;
            };
            let rel_match = rel_match.to_path_buf();
            if self.is_excluded(&rel_match) {
                continue;
            }
            let path = resolve_in_root(&self.root, &rel_match.to_string_lossy(), false)?;
            out.push(ContextSource {
                path,
                rel: rel_match,
            });
        }

        if out.is_empty() {
            return Err(BuildError::SourceNotFound(format!(
                "{}: no source files were specified",
                source
            )));
        }
        out.sort_by(|a, b| a.rel.cmp(&b.rel));
        Ok(out)
    }

    /// Reject sources that climb above the root.
    fn check_escape(&self, source: &str) -> Result<()> {
        let mut depth: i64 = 0;
        for part in source.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(BuildError::PathEscape {
                            path: source.to_string(),
                            root: self.root.clone(),
                        });
                    }
                }
                _ => depth += 1,
            }
        }
        Ok(())
    }
}

fn has_wildcard(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn context_with(files: &[&str], ignore: Option<&str>) -> (TempDir, BuildContext) {
        let tmp = TempDir::new().unwrap();
        for file in files {
            let path = tmp.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file).unwrap();
        }
        if let Some(ignore) = ignore {
            fs::write(tmp.path().join(".dockerignore"), ignore).unwrap();
        }
        let ctx = BuildContext::open(tmp.path()).unwrap();
        (tmp, ctx)
    }

    #[test]
    fn test_resolve_plain_file() {
        let (_tmp, ctx) = context_with(&["src/main.c"], None);
        let found = ctx.resolve("src/main.c").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rel, PathBuf::from("src/main.c"));
        assert!(found[0].path.ends_with("src/main.c"));
    }

    #[test]
    fn test_escape_rejected() {
        let (_tmp, ctx) = context_with(&["a"], None);
        let err = ctx.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, BuildError::PathEscape { .. }));
        let err = ctx.resolve("src/../../x").unwrap_err();
        assert!(matches!(err, BuildError::PathEscape { .. }));
    }

    #[test]
    fn test_inner_dotdot_allowed() {
        let (_tmp, ctx) = context_with(&["a/b.txt"], None);
        let found = ctx.resolve("a/../a/b.txt").unwrap();
        assert_eq!(found[0].rel, PathBuf::from("a/b.txt"));
    }

    #[test]
    fn test_missing_source() {
        let (_tmp, ctx) = context_with(&["a"], None);
        assert!(matches!(
            ctx.resolve("nope.txt").unwrap_err(),
            BuildError::SourceNotFound(_)
        ));
    }

    #[test]
    fn test_glob_expansion() {
        let (_tmp, ctx) = context_with(&["a.txt", "b.txt", "c.md"], None);
        let found = ctx.resolve("*.txt").unwrap();
        let rels: Vec<_> = found.iter().map(|s| s.rel.clone()).collect();
        assert_eq!(rels, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert!(ctx.resolve("*.rs").is_err());
    }

    #[test]
    fn test_dockerignore_excludes() {
        let (_tmp, ctx) = context_with(
            &["app/main.c", "app/build/out.o", "secret.env", "keep.env"],
            Some("# comment\n*.env\n!keep.env\napp/build\n"),
        );
        assert!(ctx.is_excluded(Path::new("secret.env")));
        assert!(!ctx.is_excluded(Path::new("keep.env")));
        assert!(ctx.is_excluded(Path::new("app/build/out.o")));
        assert!(!ctx.is_excluded(Path::new("app/main.c")));
        assert!(ctx.resolve("secret.env").is_err());
        assert_eq!(ctx.resolve("*.env").unwrap().len(), 1);
    }

    #[test]
    fn test_reinclude_below_excluded_dir() {
        let (_tmp, ctx) = context_with(
            &["app/build/out.o", "app/build/keep.o", "docs/a.md"],
            Some("app/build\n!app/build/keep.o\ndocs\n!*/README.md\n"),
        );
        assert!(ctx.is_excluded(Path::new("app/build")));
        assert!(!ctx.is_excluded(Path::new("app/build/keep.o")));
        assert!(ctx.may_reinclude_below(Path::new("app/build")));
        assert!(ctx.may_reinclude_below(Path::new("docs")));
        assert!(!ctx.may_reinclude_below(Path::new("app/build/cache")));
        assert!(!ctx.may_reinclude_below(Path::new("other/deep/dir")));
    }

    #[test]
    fn test_symlink_confined_to_context() {
        let (tmp, ctx) = context_with(&["etc/passwd"], None);
        std::os::unix::fs::symlink("/etc/passwd", tmp.path().join("link")).unwrap();
        let found = ctx.resolve("link").unwrap();
        assert_eq!(found[0].path, ctx.root().join("etc/passwd"));
    }

    #[test]
    fn test_open_missing_dir() {
        assert!(matches!(
            BuildContext::open(Path::new("/nonexistent/ctx")).unwrap_err(),
            BuildError::ConfigError(_)
        ));
    }
}
