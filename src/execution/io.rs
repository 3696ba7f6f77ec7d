//! Standard stream redirection
//!
//! Targets are opened in the parent, so open failures surface as
//! [`SandboxError::IoRedirectFailed`] before any child exists. The child only
//! duplicates the prepared descriptors onto 0, 1 and 2.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};

/// How the child's standard streams are wired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoPlan {
    /// Master switch; when false every path below is ignored
    pub redirect: bool,
    /// File read as stdin, must exist
    pub stdin: Option<PathBuf>,
    /// File created or truncated for stdout
    pub stdout: Option<PathBuf>,
    /// File created or truncated for stderr, ignored when merging
    pub stderr: Option<PathBuf>,
    /// Send stderr wherever stdout goes
    pub merge_stderr: bool,
}

impl IoPlan {
    /// Inherit all three streams from the caller
    pub fn inherit() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirect = true;
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirect = true;
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirect = true;
        self.stderr = Some(path.into());
        self
    }

    pub fn merge_stderr(mut self) -> Self {
        self.redirect = true;
        self.merge_stderr = true;
        self
    }

    /// Open every configured target.
    pub fn open_targets(&self) -> Result<RedirectTargets> {
        let mut targets = RedirectTargets::default();
        if !self.redirect {
            return Ok(targets);
        }

        if let Some(path) = non_empty(&self.stdin) {
            let file = File::open(path).map_err(|e| redirect_error("stdin", path, e))?;
            targets.bind(libc::STDIN_FILENO, file)?;
        }

        let stdout_fd = match non_empty(&self.stdout) {
            Some(path) => {
                let file = create_sink(path).map_err(|e| redirect_error("stdout", path, e))?;
                Some(targets.bind(libc::STDOUT_FILENO, file)?)
            }
            None => None,
        };

        if self.merge_stderr {
            let src = stdout_fd.unwrap_or(libc::STDOUT_FILENO);
            targets.pairs[libc::STDERR_FILENO as usize] = Some(src);
        } else if let Some(path) = non_empty(&self.stderr) {
            match (stdout_fd, non_empty(&self.stdout)) {
                (Some(fd), Some(out)) if out == path => {
                    targets.pairs[libc::STDERR_FILENO as usize] = Some(fd);
                }
                _ => {
                    let file = create_sink(path).map_err(|e| redirect_error("stderr", path, e))?;
                    targets.bind(libc::STDERR_FILENO, file)?;
                }
            }
        }

        Ok(targets)
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

fn create_sink(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
}

fn redirect_error(stream: &str, path: &Path, err: std::io::Error) -> SandboxError {
    SandboxError::IoRedirectFailed(format!("{} {}: {}", stream, path.display(), err))
}

/// Opened redirection targets, kept alive until the child has replaced its image
#[derive(Debug, Default)]
pub struct RedirectTargets {
    files: Vec<OwnedFd>,
    pairs: [Option<RawFd>; 3],
}

impl RedirectTargets {
    /// Take ownership of `file` as the source for `stream`.
    ///
    /// Sources are moved above the standard range so applying one
    /// redirection can never clobber another's source descriptor.
    fn bind(&mut self, stream: RawFd, file: File) -> Result<RawFd> {
        let fd: OwnedFd = if file.as_raw_fd() <= libc::STDERR_FILENO {
            file.as_fd().try_clone_to_owned().map_err(|e| {
                SandboxError::IoRedirectFailed(format!(
                    "moving descriptor for stream {} out of the standard range: {}",
                    stream, e
                ))
            })?
        } else {
            file.into()
        };
        let raw = fd.as_raw_fd();
        self.files.push(fd);
        self.pairs[stream as usize] = Some(raw);
        Ok(raw)
    }

    /// Source descriptor for stdin, stdout, stderr
    pub fn source(&self, stream: RawFd) -> Option<RawFd> {
        self.pairs.get(stream as usize).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.iter().all(Option::is_none)
    }

    /// Wire the prepared descriptors onto 0, 1 and 2.
    ///
    /// Called in the child after clone; performs no allocation.
    pub fn apply(&self) -> std::result::Result<(), Errno> {
        for (target, source) in self.pairs.iter().enumerate() {
            let Some(source) = *source else { continue };
            let target = target as RawFd;
            // SAFETY: plain descriptor syscalls on fds inherited from the parent
            let rc = unsafe {
                if source == target {
                    libc::fcntl(target, libc::F_SETFD, 0)
                } else {
                    libc::dup2(source, target)
                }
            };
            if rc < 0 {
                return Err(Errno::last());
            }
        }
        Ok(())
    }
}
