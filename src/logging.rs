//! Logger initialisation

use log::LevelFilter;

/// Level for a verbosity count; `quiet` wins over any count
pub fn level_filter(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the `env_logger` backend
///
/// `RUST_LOG` directives still apply on top of the computed level. Returns
/// false if a logger was already installed, which is not an error.
pub fn init(verbose: u8, quiet: bool) -> bool {
    env_logger::Builder::new()
        .filter_level(level_filter(verbose, quiet))
        .parse_default_env()
        .format_timestamp(None)
        .try_init()
        .is_ok()
}
