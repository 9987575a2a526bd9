//! Thin wrapper around `slog`/`sloggers` so consumers can depend on a single
//! `logging` module for both macro imports and logger construction.

pub use slog::{b, crit, debug, error, info, o, record, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Build the default terminal logger (debug level, stderr).
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Error parsing builtin logging config");

    config.build_logger().expect("Error building logger")
}

/// Build a logger from a `sloggers` TOML config file.
pub fn init_from_file(path: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logging config file");

    config.build_logger().expect("Error building logger")
}

/// Derive a child logger from an optional parent, falling back to a discarding
/// logger. Components take `Into<Option<&Logger>>` in their constructors and
/// pass it through here.
pub fn component<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_discards_without_parent() {
        let log = component(None);
        trace!(log, "discarded");
    }

    #[test]
    fn test_component_inherits_parent() {
        let root = Logger::root(Discard, o!());
        let log = component(&root);
        trace!(log, "discarded");
    }
}
