//! Program description and parent-side resolution

use std::ffi::{CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::utils::{resolve_program_path, split_arguments};

/// What to run and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramDescriptor {
    /// Executable path, or a bare name looked up in PATH
    pub path: String,
    /// Arguments after argv[0]
    pub args: Vec<String>,
    /// Working directory, defaults to the caller's
    pub working_dir: Option<PathBuf>,
    /// User name to run as, `None` keeps the caller's identity
    pub run_as: Option<String>,
    /// Environment variables (overrides when `inherit_env` is set)
    pub env: Vec<(String, String)>,
    /// Whether to inherit the caller's environment
    pub inherit_env: bool,
}

impl Default for ProgramDescriptor {
    fn default() -> Self {
        Self {
            path: String::new(),
            args: Vec::new(),
            working_dir: None,
            run_as: None,
            env: Vec::new(),
            inherit_env: true,
        }
    }
}

impl ProgramDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append arguments from a whitespace-separated string
    pub fn arg_string(mut self, raw: &str) -> Self {
        self.args.extend(split_arguments(raw));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        let user = user.into();
        self.run_as = (!user.is_empty()).then_some(user);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    /// Impersonation target, treating an empty name as none
    pub fn identity(&self) -> Option<&str> {
        self.run_as.as_deref().filter(|user| !user.is_empty())
    }

    /// Final environment: inherited variables with overrides applied.
    ///
    /// Inherited entries are kept as raw bytes, so variables that are not
    /// valid UTF-8 pass through untouched.
    pub fn environment(&self) -> Vec<(OsString, OsString)> {
        let mut combined: Vec<(OsString, OsString)> = if self.inherit_env {
            std::env::vars_os().collect()
        } else {
            Vec::new()
        };

        for (key, value) in &self.env {
            let value = OsString::from(value);
            if let Some((_, existing)) = combined.iter_mut().find(|(k, _)| k == key.as_str()) {
                *existing = value;
            } else {
                combined.push((OsString::from(key), value));
            }
        }
        combined
    }

    /// Validate the program and working directory and build exec arguments.
    ///
    /// Relative paths are made absolute against the caller's directory,
    /// since the child changes directory before it replaces its image.
    pub fn resolve(&self) -> Result<ResolvedProgram> {
        if self.path.trim().is_empty() {
            return Err(SandboxError::InvalidProgram(
                "program path is empty".to_string(),
            ));
        }

        let env = self.environment();
        let search_path = env
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.clone())
            .or_else(|| std::env::var_os("PATH"));

        let found = resolve_program_path(&self.path, search_path.as_deref()).ok_or_else(|| {
            SandboxError::InvalidProgram(format!("{}: command not found", self.path))
        })?;
        let caller_dir = std::env::current_dir().map_err(|e| {
            SandboxError::InvalidProgram(format!("caller working directory unavailable: {}", e))
        })?;
        let executable = absolute(&caller_dir, &found);
        check_executable(&executable)?;

        let working_dir = match &self.working_dir {
            Some(dir) => absolute(&caller_dir, dir),
            None => caller_dir,
        };
        if !working_dir.is_dir() {
            return Err(SandboxError::InvalidProgram(format!(
                "working directory {} is not a directory",
                working_dir.display()
            )));
        }

        let argv0 = executable
            .file_name()
            .map(|name| name.as_bytes().to_vec())
            .unwrap_or_else(|| executable.as_os_str().as_bytes().to_vec());

        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(to_cstring("argv[0]", argv0)?);
        for arg in &self.args {
            argv.push(to_cstring("argument", arg.as_bytes().to_vec())?);
        }

        let envp = env
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                to_cstring("environment entry", entry)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedProgram {
            executable: to_cstring("program path", executable.as_os_str().as_bytes().to_vec())?,
            working_dir: to_cstring(
                "working directory",
                working_dir.as_os_str().as_bytes().to_vec(),
            )?,
            argv,
            envp,
            display: executable,
        })
    }
}

/// Exec arguments prepared in the parent, ready to hand to the child
#[derive(Debug, Clone)]
pub struct ResolvedProgram {
    pub executable: CString,
    pub working_dir: CString,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
    display: PathBuf,
}

impl ResolvedProgram {
    /// Absolute executable path
    pub fn path(&self) -> &Path {
        &self.display
    }

    /// argv[0]
    pub fn name(&self) -> &str {
        self.argv
            .first()
            .and_then(|arg| arg.to_str().ok())
            .unwrap_or_default()
    }
}

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn check_executable(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        SandboxError::InvalidProgram(format!("{}: {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(SandboxError::InvalidProgram(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    access(path, AccessFlags::X_OK).map_err(|e| {
        SandboxError::InvalidProgram(format!("{} is not executable: {}", path.display(), e))
    })?;
    Ok(())
}

fn to_cstring(what: &str, bytes: Vec<u8>) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| SandboxError::InvalidProgram(format!("{} contains a nul byte", what)))
}
