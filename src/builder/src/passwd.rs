//! User and group lookup inside a container filesystem.

use std::path::Path;

use kiln_core::error::{BuildError, Result};

/// Resolve `user[:group]` against the container's `/etc/passwd` and
/// `/etc/group`. Numeric values are used as-is.
///
/// Without a group, the user's primary group is used (0 for unknown
/// numeric users).
pub fn lookup_user(rootfs: &Path, spec: &str) -> Result<(u32, u32)> {
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => {
            let gid = find_entry(rootfs, "etc/passwd", |fields| {
                fields.get(2).and_then(|f| f.parse::<u32>().ok()) == Some(uid)
            })
            .and_then(|fields| fields.get(3).and_then(|f| f.parse().ok()))
            .unwrap_or(0);
            (uid, gid)
        }
        Err(_) => {
            let fields = find_entry(rootfs, "etc/passwd", |fields| fields[0] == user)
                .ok_or_else(|| {
                    BuildError::ResolveError(format!("unknown user {:?} in container", user))
                })?;
            (parse_id(&fields, 2, user)?, parse_id(&fields, 3, user)?)
        }
    };

    let gid = match group {
        None | Some("") => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => {
                let fields = find_entry(rootfs, "etc/group", |fields| fields[0] == group)
                    .ok_or_else(|| {
                        BuildError::ResolveError(format!(
                            "unknown group {:?} in container",
                            group
                        ))
                    })?;
                parse_id(&fields, 2, group)?
            }
        },
    };
    Ok((uid, gid))
}

fn find_entry(
    rootfs: &Path,
    file: &str,
    matches: impl Fn(&[&str]) -> bool,
) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(rootfs.join(file)).ok()?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| matches(fields))
        .map(|fields| fields.into_iter().map(str::to_string).collect())
}

fn parse_id(fields: &[String], index: usize, name: &str) -> Result<u32> {
    fields
        .get(index)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| BuildError::ResolveError(format!("malformed entry for {:?}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn rootfs() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(
            tmp.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1001::/home/app:/bin/sh\n",
        )
        .unwrap();
        fs::write(tmp.path().join("etc/group"), "root:x:0:\nstaff:x:50:\n").unwrap();
        tmp
    }

    #[test]
    fn test_lookup_by_name() {
        let fs = rootfs();
        assert_eq!(lookup_user(fs.path(), "app").unwrap(), (1000, 1001));
        assert_eq!(lookup_user(fs.path(), "app:staff").unwrap(), (1000, 50));
    }

    #[test]
    fn test_lookup_numeric() {
        let fs = rootfs();
        assert_eq!(lookup_user(fs.path(), "1000").unwrap(), (1000, 1001));
        assert_eq!(lookup_user(fs.path(), "42:7").unwrap(), (42, 7));
        assert_eq!(lookup_user(fs.path(), "42").unwrap(), (42, 0));
    }

    #[test]
    fn test_lookup_unknown() {
        let fs = rootfs();
        assert!(lookup_user(fs.path(), "nobody").is_err());
        assert!(lookup_user(fs.path(), "app:wheel").is_err());
    }
}
