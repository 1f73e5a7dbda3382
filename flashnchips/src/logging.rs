//! Logger setup for the command-line tool

use env_logger::Env;
use log::LevelFilter;

/// Install the global logger
///
/// `RUST_LOG` takes precedence over `filter`. Targets and timestamps are
/// only shown at the debug level and below.
pub fn initialize_logger(filter: LevelFilter) {
    let detailed = filter >= LevelFilter::Debug;

    env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
        .format_target(detailed)
        .format_timestamp(detailed.then_some(env_logger::TimestampPrecision::Millis))
        .init();
}

/// Log level for a `-v` count
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
