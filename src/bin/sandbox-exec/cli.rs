use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use sandbox_exec::{
    CoarseLimits, ExecutionBuilder, ExecutionRequest, GuardPolicy, Result, SandboxError,
};

#[derive(Parser, Debug)]
#[command(name = "sandbox-exec")]
#[command(version, about = "Run a program under time and memory ceilings", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Two second wall clock, 64M of memory
    sandbox-exec -w 2000 -m 64M -- ./solution --fast

    # Deny common syscalls, isolate namespaces, capture output
    sandbox-exec --strict --stdout out.txt --merge-stderr ./solution

    # Whole request from a JSON file, result as JSON
    sandbox-exec --request job.json --json
")]
pub struct Cli {
    /// Program to run (path or name looked up in PATH)
    #[arg(value_name = "PROGRAM", required_unless_present_any = ["request", "check"])]
    pub program: Option<String>,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Extra arguments as one whitespace-separated string
    #[arg(long, value_name = "STRING")]
    pub arg_string: Option<String>,

    /// Load the full request from a JSON file
    #[arg(long, value_name = "FILE", conflicts_with = "program")]
    pub request: Option<PathBuf>,

    /// Working directory for the program
    #[arg(short = 'C', long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Run as this user (requires root)
    #[arg(short, long, value_name = "USER", env = "SANDBOX_EXEC_USER")]
    pub user: Option<String>,

    /// Read stdin from this file
    #[arg(long, value_name = "FILE")]
    pub stdin: Option<PathBuf>,

    /// Write stdout to this file
    #[arg(long, value_name = "FILE")]
    pub stdout: Option<PathBuf>,

    /// Write stderr to this file
    #[arg(long, value_name = "FILE")]
    pub stderr: Option<PathBuf>,

    /// Send stderr wherever stdout goes
    #[arg(long)]
    pub merge_stderr: bool,

    /// Wall-clock limit in milliseconds (0 = unlimited)
    #[arg(short, long, value_name = "MS", env = "SANDBOX_EXEC_WALL_TIME_MS", default_value_t = 0)]
    pub wall_time: u64,

    /// CPU time limit in milliseconds (0 = unlimited)
    #[arg(short = 't', long, value_name = "MS", env = "SANDBOX_EXEC_CPU_TIME_MS", default_value_t = 0)]
    pub cpu_time: u64,

    /// Peak memory limit (100M, 1G)
    #[arg(short, long, value_name = "SIZE", env = "SANDBOX_EXEC_MEMORY")]
    pub memory: Option<String>,

    /// Also install kernel rlimits as a backstop
    #[arg(long)]
    pub coarse_limits: bool,

    /// RLIMIT_NPROC when --coarse-limits is set
    #[arg(long, value_name = "N", default_value_t = CoarseLimits::default().max_processes)]
    pub max_processes: u64,

    /// RLIMIT_NOFILE when --coarse-limits is set
    #[arg(long, value_name = "N", default_value_t = CoarseLimits::default().max_open_files)]
    pub max_open_files: u64,

    /// Install a seccomp filter
    #[arg(long)]
    pub seccomp: bool,

    /// Deny process creation, identity changes, timers, chdir and chmod/chown
    #[arg(long, requires = "seccomp")]
    pub deny_common: bool,

    /// New mount, PID, IPC, UTS and cgroup namespaces
    #[arg(long)]
    pub isolate: bool,

    /// New network namespace
    #[arg(long)]
    pub isolate_network: bool,

    /// Every guard on
    #[arg(long, conflicts_with_all = ["seccomp", "isolate", "isolate_network"])]
    pub strict: bool,

    /// Time between resource samples in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 10)]
    pub sample_interval: u64,

    /// Time between SIGTERM and SIGKILL in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 100)]
    pub grace_period: u64,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Show verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Check which guards this host supports and exit
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    fn guard(&self) -> GuardPolicy {
        if self.strict {
            return GuardPolicy::strict();
        }
        GuardPolicy {
            seccomp_enabled: self.seccomp,
            seccomp_deny_common: self.deny_common,
            isolate_common: self.isolate,
            isolate_network: self.isolate_network,
        }
    }

    /// Turn the command line into an execution request
    pub fn to_request(&self) -> Result<ExecutionRequest> {
        if let Some(path) = &self.request {
            let json = std::fs::read_to_string(path).map_err(|e| {
                SandboxError::InvalidConfig(format!("reading {}: {}", path.display(), e))
            })?;
            let request = ExecutionRequest::from_json(&json)?;
            request.validate()?;
            return Ok(request);
        }

        let program = self.program.as_deref().unwrap_or_default();
        let mut builder = ExecutionBuilder::new(program)
            .args(self.args.iter().cloned())
            .wall_time(Duration::from_millis(self.wall_time))
            .cpu_time(Duration::from_millis(self.cpu_time))
            .guard(self.guard())
            .sample_interval(Duration::from_millis(self.sample_interval))
            .grace_period(Duration::from_millis(self.grace_period));

        if let Some(raw) = &self.arg_string {
            builder = builder.arg_string(raw);
        }
        if let Some(dir) = &self.cwd {
            builder = builder.working_dir(dir);
        }
        if let Some(user) = &self.user {
            builder = builder.run_as(user);
        }
        if let Some(path) = &self.stdin {
            builder = builder.stdin(path);
        }
        if let Some(path) = &self.stdout {
            builder = builder.stdout(path);
        }
        if let Some(path) = &self.stderr {
            builder = builder.stderr(path);
        }
        if self.merge_stderr {
            builder = builder.merge_stderr();
        }
        if let Some(memory) = &self.memory {
            builder = builder.memory_limit_str(memory)?;
        }
        if self.coarse_limits {
            builder = builder.coarse_limits(CoarseLimits {
                max_processes: self.max_processes,
                max_open_files: self.max_open_files,
                ..CoarseLimits::default()
            });
        }

        builder.build()
    }
}
