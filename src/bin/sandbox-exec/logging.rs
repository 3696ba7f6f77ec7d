use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

/// Initialize logger based on verbose flag; `RUST_LOG` still wins when set
pub fn init_logger(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let env = Env::default().filter_or("RUST_LOG", default_filter);

    Builder::new()
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .parse_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => style("ERROR").red().bold(),
                Level::Warn => style("WARN ").yellow().bold(),
                Level::Info => style("INFO ").green(),
                Level::Debug => style("DEBUG").cyan(),
                Level::Trace => style("TRACE").dim(),
            };
            writeln!(buf, "{} [{}] {}", level, record.target(), record.args())
        })
        .init();
}
