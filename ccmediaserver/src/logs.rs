//! Initialisation du système de logging
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter` (taken from
//! `RUST_LOG` when set, else from the configured minimum level) and, when
//! enabled, a console `fmt` layer.

use ccconfig::get_config;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Options d'initialisation du système de logging
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Niveau minimum quand `RUST_LOG` n'est pas défini
    pub min_level: LevelFilter,
    /// Activer la sortie console
    pub enable_console: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            min_level: LevelFilter::INFO,
            enable_console: true,
        }
    }
}

impl LoggingOptions {
    /// Options read from the `logger` section of the global configuration.
    pub fn configured() -> Self {
        let config = get_config();
        let min_level = config
            .get_log_min_level()
            .ok()
            .and_then(|l| string_to_level(&l))
            .map(LevelFilter::from_level)
            .unwrap_or(LevelFilter::INFO);
        let enable_console = config.get_log_enable_console().unwrap_or(true);

        Self {
            min_level,
            enable_console,
        }
    }
}

/// Installs the subscriber described by the configuration.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging() -> bool {
    init_logging_with(LoggingOptions::configured())
}

pub fn init_logging_with(options: LoggingOptions) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(options.min_level.into())
        .from_env_lossy();

    let console = options.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init()
        .is_ok()
}

fn string_to_level(s: &str) -> Option<Level> {
    match s.to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_level() {
        assert_eq!(string_to_level("debug"), Some(Level::DEBUG));
        assert_eq!(string_to_level("Warn"), Some(Level::WARN));
        assert_eq!(string_to_level("verbose"), None);
    }

    #[test]
    fn test_second_init_is_refused() {
        let options = LoggingOptions {
            min_level: LevelFilter::WARN,
            enable_console: false,
        };

        init_logging_with(options.clone());
        assert!(!init_logging_with(options));
    }
}
