//! Running RUN commands inside a working container.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};
use kiln_core::MountSpec;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::passwd::lookup_user;
use crate::securepath::resolve_in_root;

/// PATH used when the image environment does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// One command to execute in a container.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub container_id: String,
    /// Mounted root filesystem of the container
    pub rootfs: PathBuf,
    /// Full argv, shell prefix included for shell-form RUN
    pub args: Vec<String>,
    /// `KEY=VALUE` entries; nothing else is inherited
    pub env: Vec<String>,
    pub workdir: String,
    /// `user[:group]`, root when unset
    pub user: Option<String>,
    /// Bind mounts visible only while the command runs
    pub mounts: Vec<MountSpec>,
    pub quiet: bool,
}

/// Executes commands for the stage runner.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run to completion and return the exit code.
    ///
    /// Cancelling `cancel` stops the command and yields
    /// [`BuildError::Canceled`].
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<i32>;
}

/// Runs commands with `chroot(2)` into the container root.
///
/// Needs `CAP_SYS_CHROOT`, plus `CAP_SYS_ADMIN` when mounts are requested.
#[derive(Debug, Default, Clone)]
pub struct ChrootRuntime;

impl ChrootRuntime {
    pub fn new() -> Self {
        Self
    }
}

struct PreparedMount {
    source: CString,
    target: CString,
    read_only: bool,
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes)
        .map_err(|e| BuildError::RuntimeError(format!("invalid path for exec: {}", e)))
}

fn prepare_mounts(request: &RunRequest) -> Result<Vec<PreparedMount>> {
    let mut prepared = Vec::new();
    for mount in &request.mounts {
        let target = resolve_in_root(&request.rootfs, &mount.destination, true)?;
        if mount.source.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if !target.exists() {
            std::fs::write(&target, b"")?;
        }
        prepared.push(PreparedMount {
            source: cstring(mount.source.as_os_str().as_bytes())?,
            target: cstring(target.as_os_str().as_bytes())?,
            read_only: mount.read_only,
        });
    }
    Ok(prepared)
}

/// Environment for the child: `env` plus a default PATH.
fn command_env(env: &[String]) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = env
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect();
    if !vars.iter().any(|(k, _)| k == "PATH") {
        vars.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
    }
    vars
}

fn check(ret: libc::c_int) -> std::io::Result<()> {
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for ChrootRuntime {
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<i32> {
        let (program, rest) = request
            .args
            .split_first()
            .ok_or_else(|| BuildError::RuntimeError("empty command".to_string()))?;

        let ids = match request.user.as_deref() {
            Some(user) if !user.is_empty() => Some(lookup_user(&request.rootfs, user)?),
            _ => None,
        };
        let root = cstring(request.rootfs.as_os_str().as_bytes())?;
        let workdir = cstring(request.workdir.as_bytes())?;
        let mounts = prepare_mounts(request)?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .env_clear()
            .envs(command_env(&request.env))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if request.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        // SAFETY: the closure only calls async-signal-safe libc functions on
        // data prepared before the fork.
        unsafe {
            cmd.pre_exec(move || {
                if !mounts.is_empty() {
                    check(libc::unshare(libc::CLONE_NEWNS))?;
                    check(libc::mount(
                        std::ptr::null(),
                        b"/\0".as_ptr() as *const libc::c_char,
                        std::ptr::null(),
                        libc::MS_REC | libc::MS_PRIVATE,
                        std::ptr::null(),
                    ))?;
                    for m in &mounts {
                        check(libc::mount(
                            m.source.as_ptr(),
                            m.target.as_ptr(),
                            std::ptr::null(),
                            libc::MS_BIND | libc::MS_REC,
                            std::ptr::null(),
                        ))?;
                        if m.read_only {
                            check(libc::mount(
                                std::ptr::null(),
                                m.target.as_ptr(),
                                std::ptr::null(),
                                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_REC,
                                std::ptr::null(),
                            ))?;
                        }
                    }
                }
                check(libc::chroot(root.as_ptr()))?;
                check(libc::chdir(workdir.as_ptr()))?;
                if let Some((uid, gid)) = ids {
                    check(libc::setgroups(0, std::ptr::null()))?;
                    check(libc::setgid(gid))?;
                    check(libc::setuid(uid))?;
                }
                Ok(())
            });
        }

        tracing::debug!(
            container = %request.container_id,
            command = ?request.args,
            workdir = %request.workdir,
            "Running command"
        );
        let mut child = cmd.spawn().map_err(|e| {
            BuildError::RuntimeError(format!("Failed to start {:?}: {}", request.args, e))
        })?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| {
                    BuildError::RuntimeError(format!("Failed to wait for command: {}", e))
                })?;
                Ok(status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
            }
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                tracing::debug!(container = %request.container_id, "Command canceled");
                Err(BuildError::Canceled)
            }
        }
    }
}
