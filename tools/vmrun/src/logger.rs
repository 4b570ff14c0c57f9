//! stderr logging through `env_logger`.

use log::LevelFilter;

/// Maps `-v` occurrences to a level: warnings by default, then info, debug
/// and trace.
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Builds the logger for `level`; RUST_LOG overrides it.
pub fn builder(level: LevelFilter) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None);
    builder
}

pub fn init(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    builder(level).try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for(0), LevelFilter::Warn);
        assert_eq!(level_for(2), LevelFilter::Debug);
        assert_eq!(level_for(9), LevelFilter::Trace);
    }

    #[test]
    fn builder_installs_once() {
        assert!(init(LevelFilter::Info).is_ok());
        assert!(init(LevelFilter::Debug).is_err());
    }
}
