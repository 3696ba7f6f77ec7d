//! Integration tests for sandbox-exec
//!
//! These tests run the `sandbox-workload` binary under the engine. Tests that
//! need kernel features the host may lack (namespaces, seccomp) accept the
//! corresponding setup error instead of failing.

use sandbox_exec::{
    execute, ExecutionBuilder, GuardPolicy, IoPlan, KillReason, LimitPolicy, Outcome,
    ProgramDescriptor, SandboxError,
};
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

static INTEGRATION_TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    INTEGRATION_TEST_LOCK
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn workload() -> ExecutionBuilder {
    ExecutionBuilder::new(env!("CARGO_BIN_EXE_sandbox-workload"))
}

/// Program exits 0 instantly with no limits
#[test]
fn test_instant_exit_no_limits() {
    let _lock = lock();

    let result = workload().args(["exit", "0"]).run().unwrap();

    assert_eq!(result.outcome, Outcome::Exited);
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.is_killed);
    assert!(result.kill_reason.is_none());
    assert!(result.success());
}

/// Infinite loop under a one second wall clock
#[test]
fn test_wall_time_kill() {
    let _lock = lock();

    let result = workload()
        .arg("spin")
        .wall_time(Duration::from_millis(1000))
        .run()
        .unwrap();

    assert_eq!(result.outcome, Outcome::Killed);
    assert_eq!(result.kill_reason, Some(KillReason::WallTimeExceeded));
    assert!(result.exit_code.is_none());
    assert!(result.usage.wall_time_ms >= 1000);
    assert!(
        result.usage.wall_time_ms <= 1200,
        "killed too late: {}ms",
        result.usage.wall_time_ms
    );
}

/// 200MB allocation against a 50MB ceiling with no time ceilings
#[test]
fn test_memory_kill() {
    let _lock = lock();

    let result = workload()
        .args(["alloc", "200"])
        .memory_limit_str("50M")
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(result.outcome, Outcome::Killed);
    assert_eq!(result.kill_reason, Some(KillReason::MemoryExceeded));
    assert!(result.usage.peak_memory_bytes > 50 * 1024 * 1024);
}

/// A path that does not resolve fails before any process exists
#[test]
fn test_missing_program_is_setup_error() {
    let _lock = lock();

    let err = ExecutionBuilder::new("/nonexistent/definitely/not/here")
        .run()
        .unwrap_err();

    assert!(matches!(err, SandboxError::InvalidProgram(_)), "{:?}", err);
    assert!(err.is_setup_error());
}

/// A bare name that is not on PATH
#[test]
fn test_unknown_command_name() {
    let _lock = lock();

    let err = ExecutionBuilder::new("sandbox-exec-no-such-command")
        .run()
        .unwrap_err();

    assert!(matches!(err, SandboxError::InvalidProgram(_)));
}

/// CPU-bound loop under a CPU ceiling
#[test]
fn test_cpu_time_kill() {
    let _lock = lock();

    let result = workload()
        .arg("spin")
        .cpu_time(Duration::from_millis(300))
        .wall_time(Duration::from_secs(10))
        .run()
        .unwrap();

    assert_eq!(result.kill_reason, Some(KillReason::CpuTimeExceeded));
    assert!(result.usage.cpu_time_ms > 300);
    assert!(result.usage.wall_time_ms < 10_000);
}

/// A sleeping program does not use CPU, so only the wall clock stops it
#[test]
fn test_sleep_is_wall_not_cpu() {
    let _lock = lock();

    let result = workload()
        .args(["sleep", "5000"])
        .cpu_time(Duration::from_millis(200))
        .wall_time(Duration::from_millis(400))
        .run()
        .unwrap();

    assert_eq!(result.kill_reason, Some(KillReason::WallTimeExceeded));
    assert!(result.usage.cpu_time_ms < 200);
}

/// Zero ceilings mean unlimited
#[test]
fn test_zero_ceilings_are_unlimited() {
    let _lock = lock();

    let program = ProgramDescriptor::new(env!("CARGO_BIN_EXE_sandbox-workload"))
        .args(["spin", "--for-ms", "200"]);
    let limits = LimitPolicy::default();
    assert_eq!(limits, LimitPolicy::unlimited());

    let result = execute(&program, &IoPlan::inherit(), &limits, &GuardPolicy::disabled()).unwrap();

    assert_eq!(result.outcome, Outcome::Exited);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.usage.cpu_time_ms > 0);
}

/// Exit codes pass through unchanged
#[test]
fn test_exit_code_propagation() {
    let _lock = lock();

    for code in [1, 42, 255] {
        let result = workload().args(["exit", &code.to_string()]).run().unwrap();
        assert_eq!(result.outcome, Outcome::Exited);
        assert_eq!(result.exit_code, Some(code));
        assert!(!result.success());
    }
}

/// A signal the engine did not send is reported as Signaled
#[test]
fn test_self_signal_is_signaled() {
    let _lock = lock();

    let result = workload().args(["raise", "SEGV"]).run().unwrap();

    assert_eq!(result.outcome, Outcome::Signaled);
    assert_eq!(result.exit_signal, Some(libc::SIGSEGV));
    assert!(!result.is_killed);
    assert!(result.exit_code.is_none());
}

/// Running the same request twice gives the same outcome
#[test]
fn test_repeated_execution_is_consistent() {
    let _lock = lock();

    let request = workload().args(["exit", "5"]).build().unwrap();
    let first = request.run().unwrap();
    let second = request.run().unwrap();

    assert_eq!(first.outcome, second.outcome);
    assert_eq!(first.exit_code, second.exit_code);
}

/// Stdout goes to the requested file
#[test]
fn test_stdout_redirect() {
    let _lock = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let err = dir.path().join("err.txt");

    let result = workload()
        .args(["echo", "hello"])
        .stdout(&out)
        .stderr(&err)
        .run()
        .unwrap();

    assert!(result.success());
    assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
    assert_eq!(fs::read_to_string(&err).unwrap(), "err: hello\n");
}

/// Merged stderr lands in the stdout file
#[test]
fn test_merge_stderr() {
    let _lock = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("combined.txt");

    let result = workload()
        .args(["echo", "both"])
        .stdout(&out)
        .merge_stderr()
        .run()
        .unwrap();

    assert!(result.success());
    let content = fs::read_to_string(&out).unwrap();
    assert!(content.contains("both\n"));
    assert!(content.contains("err: both\n"));
}

/// Stdin is read from the requested file
#[test]
fn test_stdin_redirect() {
    let _lock = lock();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let out = dir.path().join("out.txt");
    fs::write(&input, "line one\nline two\n").unwrap();

    let result = workload()
        .arg("cat")
        .stdin(&input)
        .stdout(&out)
        .run()
        .unwrap();

    assert!(result.success());
    assert_eq!(fs::read_to_string(&out).unwrap(), "line one\nline two\n");
}

/// A missing stdin file fails before launch
#[test]
fn test_missing_stdin_is_setup_error() {
    let _lock = lock();
    let dir = tempfile::tempdir().unwrap();

    let err = workload()
        .arg("cat")
        .stdin(dir.path().join("absent.txt"))
        .run()
        .unwrap_err();

    assert!(matches!(err, SandboxError::IoRedirectFailed(_)), "{:?}", err);
}

/// The program starts in the requested working directory
#[test]
fn test_working_directory() {
    let _lock = lock();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("pwd.txt");
    let expected = fs::canonicalize(dir.path()).unwrap();

    let result = workload()
        .arg("pwd")
        .working_dir(dir.path())
        .stdout(&out)
        .run()
        .unwrap();

    assert!(result.success());
    let printed = fs::read_to_string(&out).unwrap();
    assert_eq!(fs::canonicalize(printed.trim()).unwrap(), expected);
}

/// A working directory that does not exist fails before launch
#[test]
fn test_missing_working_directory() {
    let _lock = lock();

    let err = workload()
        .arg("pwd")
        .working_dir("/nonexistent/working/dir")
        .run()
        .unwrap_err();

    assert!(matches!(err, SandboxError::InvalidProgram(_)));
}

/// Running as an unknown user is refused
#[test]
fn test_unknown_user_is_permission_denied() {
    let _lock = lock();

    let err = workload()
        .args(["exit", "0"])
        .run_as("sandbox-exec-no-such-user")
        .run()
        .unwrap_err();

    assert!(matches!(err, SandboxError::PermissionDenied(_)), "{:?}", err);
}

/// Fork under the "deny common" filter ends in SIGSYS
#[test]
fn test_seccomp_denies_fork() {
    let _lock = lock();

    let guard = GuardPolicy {
        seccomp_enabled: true,
        seccomp_deny_common: true,
        ..GuardPolicy::disabled()
    };
    let result = workload().arg("fork").guard(guard).run();

    match result {
        Ok(result) => {
            assert!(result.guard_violation(), "{:?}", result);
            assert!(!result.is_killed);
        }
        Err(SandboxError::GuardApplyFailed(_)) => {}
        Err(e) => panic!("unexpected error: {:?}", e),
    }
}

/// Seccomp with no deny list does not interfere
#[test]
fn test_seccomp_without_deny_list_allows_fork() {
    let _lock = lock();

    let guard = GuardPolicy {
        seccomp_enabled: true,
        ..GuardPolicy::disabled()
    };
    let result = workload().arg("fork").guard(guard).run();

    match result {
        Ok(result) => assert!(result.success(), "{:?}", result),
        Err(SandboxError::GuardApplyFailed(_)) => {}
        Err(e) => panic!("unexpected error: {:?}", e),
    }
}

/// Namespaced child still runs and reports its exit code
#[test]
fn test_namespace_isolation() {
    let _lock = lock();

    let guard = GuardPolicy {
        isolate_common: true,
        isolate_network: true,
        ..GuardPolicy::disabled()
    };
    let result = workload().args(["exit", "9"]).guard(guard).run();

    match result {
        Ok(result) => {
            assert_eq!(result.outcome, Outcome::Exited);
            assert_eq!(result.exit_code, Some(9));
        }
        Err(SandboxError::GuardApplyFailed(_)) => {}
        Err(e) => panic!("unexpected error: {:?}", e),
    }
}

/// Legacy single-flag guard behaves like the canonical fields
#[test]
fn test_legacy_guard_form() {
    let _lock = lock();

    let guard = GuardPolicy::from_legacy(true, true, false);
    assert!(guard.seccomp_enabled && guard.seccomp_deny_common);
    assert!(!guard.isolate_common && !guard.isolate_network);

    let result = workload().args(["exit", "0"]).guard(guard).run();
    match result {
        Ok(result) => assert!(result.success()),
        Err(SandboxError::GuardApplyFailed(_)) => {}
        Err(e) => panic!("unexpected error: {:?}", e),
    }
}

/// The rlimit backstop does not disturb a well-behaved program
#[test]
fn test_coarse_limits_allow_normal_exit() {
    let _lock = lock();
    let dir = tempfile::tempdir().unwrap();

    let result = workload()
        .args(["echo", "ok"])
        .stdout(dir.path().join("out.txt"))
        .cpu_time(Duration::from_secs(2))
        .coarse_limits(Default::default())
        .run()
        .unwrap();

    assert!(result.success(), "{:?}", result);
}

/// A program that ignores SIGTERM is still stopped
#[test]
fn test_sigterm_ignoring_program_is_killed() {
    let _lock = lock();

    let result = workload()
        .args(["stubborn", "10000"])
        .wall_time(Duration::from_millis(300))
        .grace_period(Duration::from_millis(50))
        .run()
        .unwrap();

    assert_eq!(result.kill_reason, Some(KillReason::WallTimeExceeded));
    assert!(result.usage.wall_time_ms < 2000);
}

/// Requests round-trip through JSON and run
#[test]
fn test_json_request() {
    let _lock = lock();

    let json = format!(
        r#"{{"program": {{"path": "{}", "args": ["exit", "4"]}}, "limits": {{"wall_time_ms": 5000}}}}"#,
        env!("CARGO_BIN_EXE_sandbox-workload")
    );
    let request = sandbox_exec::ExecutionRequest::from_json(&json).unwrap();
    let result = request.run().unwrap();

    assert_eq!(result.exit_code, Some(4));
    assert!(result.usage.wall_time_ms < 5000);
}
