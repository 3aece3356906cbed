//! Logging initialisation via tracing-subscriber.
//!
//! Orchestrator events go through `tracing` to stderr. Lines forwarded from
//! the launched processes go to the aggregated [`crate::tail::LogSink`]
//! instead, so the two streams never interleave mid-line.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::ClusterError;

/// Initialise the global tracing subscriber.
///
/// If `prefer_level` is `true`, `level` takes precedence and `RUST_LOG` is only
/// used as a fallback when `level` is invalid. If `prefer_level` is `false`,
/// `RUST_LOG` takes precedence and `level` is the fallback.
pub fn init(level: &str, prefer_level: bool) -> Result<(), ClusterError> {
    let filter = if prefer_level {
        match EnvFilter::try_new(level) {
            Ok(filter) => filter,
            Err(level_err) => EnvFilter::try_from_default_env().map_err(|env_err| {
                ClusterError::Logger(format!(
                    "invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}"
                ))
            })?,
        }
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| ClusterError::Logger(format!("invalid log level '{level}': {e}")))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| ClusterError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

/// Parse a log level string into a [`LevelFilter`], returning an error on
/// unrecognised values.
pub fn parse_level(level: &str) -> Result<LevelFilter, ClusterError> {
    if level.is_empty() {
        return Err(ClusterError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| ClusterError::Logger(format!("unrecognised log level: '{level}'")))
}

/// Map a `-v` count onto a level, starting from `base`.
pub fn bump_level(base: &str, verbosity: u8) -> &'static str {
    const LADDER: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    let start = LADDER
        .iter()
        .position(|l| l.eq_ignore_ascii_case(base))
        .unwrap_or(2);
    LADDER[(start + verbosity as usize).min(LADDER.len() - 1)]
}
