//! Deterministic workloads for exercising the sandbox

use clap::{Parser, Subcommand};
use std::hint::black_box;
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "sandbox-workload")]
#[command(about = "Predictable programs to run inside sandbox-exec", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Workload,
}

#[derive(Subcommand, Debug)]
enum Workload {
    /// Exit immediately with CODE
    Exit { code: i32 },

    /// Burn CPU, forever or for MS milliseconds
    Spin {
        #[arg(long, value_name = "MS")]
        for_ms: Option<u64>,
    },

    /// Sleep for MS milliseconds
    Sleep { ms: u64 },

    /// Allocate and touch MB megabytes, then hold them
    Alloc {
        mb: usize,
        /// How long to hold the memory in milliseconds
        #[arg(long, value_name = "MS", default_value_t = 5000)]
        hold_ms: u64,
    },

    /// Raise SIGNAL against ourselves
    Raise { signal: String },

    /// Write TEXT to stdout and `err: TEXT` to stderr
    Echo { text: String },

    /// Copy stdin to stdout
    Cat,

    /// Try to fork and report what happened
    Fork,

    /// Print the working directory
    Pwd,

    /// Ignore SIGTERM and sleep for MS milliseconds
    Stubborn { ms: u64 },
}

fn spin(limit: Option<Duration>) {
    let start = Instant::now();
    let mut acc: u64 = 0;
    loop {
        for i in 0..100_000u64 {
            acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
        }
        if limit.is_some_and(|limit| start.elapsed() >= limit) {
            break;
        }
    }
    black_box(acc);
}

fn alloc(mb: usize, hold: Duration) {
    let mut blocks = Vec::with_capacity(mb);
    for _ in 0..mb {
        // Touch every page so the kernel actually backs it
        let mut block = vec![0u8; 1024 * 1024];
        for page in block.chunks_mut(4096) {
            page[0] = 1;
        }
        blocks.push(black_box(block));
    }
    thread::sleep(hold);
    black_box(&blocks);
}

fn parse_signal(name: &str) -> Option<libc::c_int> {
    if let Ok(number) = name.parse() {
        return Some(number);
    }
    let signal = match name.trim_start_matches("SIG").to_uppercase().as_str() {
        "SEGV" => libc::SIGSEGV,
        "ABRT" => libc::SIGABRT,
        "KILL" => libc::SIGKILL,
        "TERM" => libc::SIGTERM,
        "INT" => libc::SIGINT,
        "FPE" => libc::SIGFPE,
        "USR1" => libc::SIGUSR1,
        _ => return None,
    };
    Some(signal)
}

fn raise(name: &str) -> i32 {
    let Some(signal) = parse_signal(name) else {
        eprintln!("unknown signal: {}", name);
        return 2;
    };
    // SAFETY: restoring the default disposition and raising is sound in a
    // single-threaded process
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
    1
}

fn fork_once() -> i32 {
    // SAFETY: the child only calls _exit
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            println!("fork failed: {}", io::Error::last_os_error());
            1
        }
        0 => unsafe { libc::_exit(0) },
        child => {
            let mut status = 0;
            // SAFETY: waiting on our own child
            unsafe { libc::waitpid(child, &mut status, 0) };
            println!("forked {}", child);
            0
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Workload::Exit { code } => code,
        Workload::Spin { for_ms } => {
            spin(for_ms.map(Duration::from_millis));
            0
        }
        Workload::Sleep { ms } => {
            thread::sleep(Duration::from_millis(ms));
            0
        }
        Workload::Alloc { mb, hold_ms } => {
            alloc(mb, Duration::from_millis(hold_ms));
            0
        }
        Workload::Raise { signal } => raise(&signal),
        Workload::Echo { text } => {
            println!("{}", text);
            eprintln!("err: {}", text);
            0
        }
        Workload::Cat => {
            let mut input = Vec::new();
            match io::stdin().read_to_end(&mut input) {
                Ok(_) => {
                    let _ = io::stdout().write_all(&input);
                    0
                }
                Err(e) => {
                    eprintln!("read failed: {}", e);
                    1
                }
            }
        }
        Workload::Fork => fork_once(),
        Workload::Pwd => match std::env::current_dir() {
            Ok(dir) => {
                println!("{}", dir.display());
                0
            }
            Err(e) => {
                eprintln!("pwd failed: {}", e);
                1
            }
        },
        Workload::Stubborn { ms } => {
            // SAFETY: ignoring a signal has no memory-safety implications
            unsafe { libc::signal(libc::SIGTERM, libc::SIG_IGN) };
            thread::sleep(Duration::from_millis(ms));
            0
        }
    };

    let _ = io::stdout().flush();
    std::process::exit(code);
}
