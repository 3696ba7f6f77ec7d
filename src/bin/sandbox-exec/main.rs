//! sandbox-exec CLI - run one program under time, CPU and memory ceilings

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::Cli;
use console::style;

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    if cli.check {
        commands::check_requirements();
        return;
    }

    match runner::run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}
