//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use ujlaser_core::config::{LogFormat, LoggingConfig};

/// Subscriber options resolved from the `[logging]` config section.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output layout.
    pub format: LogFormat,
    /// Include file and line numbers
    pub with_file_and_line: bool,
}

impl TracingConfig {
    /// Resolve the `[logging]` section, rejecting unknown levels.
    pub fn from_config(config: &LoggingConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: config.format,
            with_file_and_line: config.format != LogFormat::Compact,
        })
    }
}

/// Install the global subscriber.
///
/// Idempotent: a subscriber installed earlier (tests, embedding code) is kept.
pub fn init(config: &TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    level
        .parse::<Level>()
        .map_err(|_| format!("unknown log level '{level}' (trace, debug, info, warn, error)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn resolves_from_logging_section() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Json,
        };
        let tracing = TracingConfig::from_config(&config).unwrap();
        assert_eq!(tracing.level, Level::DEBUG);
        assert_eq!(tracing.format, LogFormat::Json);
        assert!(tracing.with_file_and_line);
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = TracingConfig::from_config(&LoggingConfig::default()).unwrap();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
