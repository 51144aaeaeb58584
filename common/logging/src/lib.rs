use slog::Logger;
use sloggers::types::{Severity, SourceLocation};
use sloggers::Build;

/// Levels accepted by `build_logger`, lowest first.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "crit"];

/// Build the terminal logger used by the daemon.
///
/// `level` is one of `LOG_LEVELS`.
pub fn build_logger(level: &str) -> Result<Logger, String> {
    let severity = match level.to_lowercase().as_str() {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "info" => Severity::Info,
        "warn" => Severity::Warning,
        "error" => Severity::Error,
        "crit" => Severity::Critical,
        other => return Err(format!("Unsupported log level: {}", other)),
    };

    sloggers::terminal::TerminalLoggerBuilder::new()
        .level(severity)
        .source_location(SourceLocation::None)
        .destination(sloggers::terminal::Destination::Stderr)
        .build()
        .map_err(|e| format!("Unable to build logger: {:?}", e))
}

/// Return a logger suitable for test usage.
///
/// By default no logs will be printed, but they can be enabled via the `test_logger` feature:
///
/// ```bash
/// cargo test -p watch --features 'logging/test_logger'
/// ```
pub fn test_logger() -> Logger {
    if cfg!(feature = "test_logger") {
        sloggers::terminal::TerminalLoggerBuilder::new()
            .level(Severity::Debug)
            .build()
            .expect("Should build test_logger")
    } else {
        sloggers::null::NullLoggerBuilder
            .build()
            .expect("Should build null_logger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_every_documented_level() {
        for level in LOG_LEVELS {
            assert!(build_logger(level).is_ok(), "{}", level);
        }
        assert!(build_logger("loud").is_err());
    }
}
