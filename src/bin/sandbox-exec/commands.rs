use log::info;
use std::fs;

use sandbox_exec::utils;

fn unprivileged_userns() -> bool {
    let enabled = fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
        .map(|v| v.trim() != "0")
        .unwrap_or(true);
    let max = fs::read_to_string("/proc/sys/user/max_user_namespaces")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    enabled && max > 0
}

fn seccomp_supported() -> bool {
    fs::read_to_string("/proc/self/status")
        .map(|status| status.lines().any(|line| line.starts_with("Seccomp:")))
        .unwrap_or(false)
}

fn mark(ok: bool) -> &'static str {
    if ok { "[✓]" } else { "[✗]" }
}

pub fn check_requirements() {
    info!("Checking host capabilities");
    println!("Checking host capabilities...\n");

    let root = utils::is_root();
    println!(
        "{} Running as root{}",
        mark(root),
        if root { "" } else { " (run_as and full isolation unavailable)" }
    );

    let userns = unprivileged_userns();
    println!("{} Unprivileged user namespaces", mark(userns));
    println!("{} Namespace isolation", mark(root || userns));
    println!("{} Seccomp filtering", mark(seccomp_supported()));

    println!("\nSystem info:");
    println!("  UID: {}", utils::get_uid());
    println!("  GID: {}", utils::get_gid());
    println!("  Arch: {}", std::env::consts::ARCH);
}
