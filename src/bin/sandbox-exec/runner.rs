use console::style;
use log::{debug, info};

use sandbox_exec::{ExecutionRequest, ExecutionResult, Outcome, Result};

use crate::cli::Cli;

/// Exit status the CLI mirrors for a finished execution
pub fn exit_status(result: &ExecutionResult) -> i32 {
    match result.outcome {
        Outcome::Exited => result.exit_code.unwrap_or(1),
        Outcome::Signaled => 128 + result.exit_signal.unwrap_or_default(),
        Outcome::Killed => 128 + libc::SIGKILL,
    }
}

fn print_summary(result: &ExecutionResult) {
    let outcome = match result.outcome {
        Outcome::Exited if result.success() => style(result.summary()).green().bold(),
        Outcome::Exited => style(result.summary()).yellow().bold(),
        Outcome::Signaled | Outcome::Killed => style(result.summary()).red().bold(),
    };

    println!(
        "{} | {}={} | {}={} | {}={}",
        outcome,
        style("wall_time_ms").dim(),
        style(result.usage.wall_time_ms).bold(),
        style("cpu_time_ms").dim(),
        style(result.usage.cpu_time_ms).bold(),
        style("peak_memory_bytes").dim(),
        style(result.usage.peak_memory_bytes).bold(),
    );
}

fn describe(request: &ExecutionRequest) {
    debug!("Program: {} {:?}", request.program.path, request.program.args);
    debug!(
        "Limits: wall={}ms cpu={}ms memory={}B coarse={}",
        request.limits.wall_time_ms,
        request.limits.cpu_time_ms,
        request.limits.memory_bytes,
        request.limits.coarse_limits
    );
    debug!("Guard: {:?}", request.guard);
}

/// Run the request described by the command line and return the exit status
pub fn run(cli: &Cli) -> Result<i32> {
    let request = cli.to_request()?;
    describe(&request);

    info!("Executing: {}", request.program.path);
    let result = request.run()?;
    info!("Execution finished: {}", result.summary());

    if cli.json {
        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            sandbox_exec::SandboxError::InvalidConfig(format!("encoding result: {}", e))
        })?;
        println!("{}", json);
    } else {
        print_summary(&result);
    }

    Ok(exit_status(&result))
}
