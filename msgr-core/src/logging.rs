//! Structured logging setup using the `tracing` ecosystem.
//!
//! Console output goes to stderr so stdout stays free for event output.
//! A daily-rotated file is written next to it, as text or JSON lines.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_appender::rolling;

use crate::config::LoggingConfig;
use crate::constants;
use crate::error::MsgrResult;

/// Crates that are chatty at debug level and only interesting when asked for.
const QUIET_TARGETS: &[&str] = &["rumqttc", "tokio_tungstenite", "tungstenite", "hyper", "reqwest"];

/// Build the filter for `level`, capping the transport stack at `warn`
/// unless the directive names one of those crates itself.
pub fn filter_for(level: &str) -> EnvFilter {
    let mut directives = match EnvFilter::try_new(level) {
        Ok(_) => level.to_string(),
        Err(_) => "info".to_string(),
    };
    for target in QUIET_TARGETS {
        if !directives.contains(target) {
            directives.push_str(&format!(",{target}=warn"));
        }
    }
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber.
///
/// `level` overrides `settings.level` (the CLI's `--verbose`).
pub fn init_logging(settings: &LoggingConfig, log_dir: &Path, level: Option<&str>) -> MsgrResult<LogGuard> {
    std::fs::create_dir_all(log_dir)?;
    let level = level.unwrap_or(&settings.level);

    let file_appender = rolling::daily(log_dir, format!("{}.log", constants::APP_NAME));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    let registry = tracing_subscriber::registry()
        .with(filter_for(level))
        .with(console_layer);
    if settings.json_output {
        registry.with(file_layer.json()).init();
    } else {
        registry.with(file_layer).init();
    }

    tracing::info!("logging initialized at level={level}, dir={}", log_dir.display());

    Ok(LogGuard { _guard: guard })
}

/// Keeps the non-blocking file writer alive; dropping it flushes the file.
pub struct LogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Console-only logger for tests. Repeated calls are no-ops.
pub fn init_console_logging(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter_for(level))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true).compact())
        .try_init();
}
