pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};
use std::env;

/// Environment variable enabling verbose trace output on stdout.
pub const DEBUG_ENV: &str = "FRONTEND_DEBUG";

/// Builds the root logger for the frontend. Trace severity is selected when
/// `FRONTEND_DEBUG` is set in the environment, otherwise the logger stays at
/// info and only session-level events are emitted.
pub fn init() -> Logger {
    let level = match env::var_os(DEBUG_ENV) {
        Some(_) => "trace",
        None => "info",
    };

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stdout"
"#,
        level
    ))
    .expect("Error parsing logger config");

    config.build_logger().expect("Error building logger")
}

/// Returns a child of the supplied logger, or a discarding logger when no
/// parent is given. Used by constructors taking `Into<Option<&Logger>>`.
pub fn child_or_discard(log: Option<&Logger>) -> Logger {
    match log {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
