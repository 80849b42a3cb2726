//! Process-wide `tracing` setup. Logs go to stderr so command output on
//! stdout (reports, predictions) stays clean.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::{PipelineError, Result};

/// Pick the filter: an explicit `-v` level beats `RUST_LOG`, which beats the
/// configured level.
fn build_filter(level: &str, from_cli: bool) -> Result<EnvFilter> {
    let bad_level = |e: tracing_subscriber::filter::ParseError| PipelineError::Logger(format!("'{level}' is not a usable filter: {e}"));
    if from_cli {
        return EnvFilter::try_new(level).map_err(bad_level);
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(bad_level),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str, from_cli: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(level, from_cli)?)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| PipelineError::Logger(e.to_string()))
}

/// Plain level names only (`warn`, `info`, ...); used to validate config.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.trim() {
        "" => Err(PipelineError::Logger("empty log level".into())),
        l => l
            .parse()
            .map_err(|_| PipelineError::Logger(format!("unknown log level '{l}'"))),
    }
}

/// `-v` is debug, `-vv` and up is trace.
pub fn level_for_verbosity(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_filters() {
        assert_eq!(parse_level("warn").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level(" debug ").unwrap(), LevelFilter::DEBUG);
        assert!(matches!(parse_level("loud"), Err(PipelineError::Logger(_))));
        assert!(parse_level("").is_err());
    }

    #[test]
    fn cli_level_is_used_verbatim() {
        assert!(build_filter("taxi_duration_predictor=trace", true).is_ok());
        assert!(build_filter("taxi_duration_predictor=loud", true).is_err());
    }

    #[test]
    fn verbosity_counts() {
        let levels: Vec<_> = (0..4).map(level_for_verbosity).collect();
        assert_eq!(levels, vec![None, Some("debug"), Some("trace"), Some("trace")]);
    }
}
