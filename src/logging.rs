//! Logging bootstrap
//!
//! Console logging scoped to this crate's target, with an optional
//! daily-rolling file layer. Either layer switches to flattened JSON for
//! log collectors.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_TARGET: &str = "arbor";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level applied to this crate's target when `RUST_LOG` is unset.
    pub level: tracing::Level,
    pub json_format: bool,
    /// Colorize console output when it is a terminal.
    pub colorize: bool,
    /// Directory for the rolling `arbor.log`. `None` disables file output.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: tracing::Level::INFO,
            json_format: false,
            colorize: true,
            log_dir: None,
        }
    }
}

/// Keeps the file appender's worker thread alive; hold it for the lifetime
/// of the process.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

fn filter_directives(level: tracing::Level) -> String {
    let level = match level {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    };
    format!("{}={}", LOG_TARGET, level)
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> LogGuard {
    // Route `log`-facade records through tracing as well.
    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config.level)));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.colorize)
        .with_timer(ChronoUtc::new(TIMESTAMP_FORMAT.to_string()));
    let console_layer = if config.json_format {
        console_layer.json().flatten_event(true).boxed()
    } else {
        console_layer.boxed()
    };
    let mut layers = vec![console_layer];

    let mut file_guard = None;
    if let Some(log_dir) = &config.log_dir {
        match std::fs::create_dir_all(log_dir) {
            Ok(()) => {
                let appender =
                    RollingFileAppender::new(Rotation::DAILY, log_dir, format!("{}.log", LOG_TARGET));
                let (writer, guard) = tracing_appender::non_blocking(appender);
                file_guard = Some(guard);

                let file_layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_timer(ChronoUtc::new(TIMESTAMP_FORMAT.to_string()))
                    .with_writer(writer);
                let file_layer = if config.json_format {
                    file_layer.json().flatten_event(true).boxed()
                } else {
                    file_layer.boxed()
                };
                layers.push(file_layer);
            }
            Err(error) => {
                eprintln!("failed to create log directory {:?}: {}", log_dir, error);
            }
        }
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}
