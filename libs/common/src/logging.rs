//! Logging bootstrap for rctmon
//!
//! Console output always, an optional daily rolling file next to it. Raw wire
//! traffic is emitted on the [`FRAME_TARGET`] target at `TRACE` level and only
//! shows up when frame debugging is requested.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use errors::{RctmonError, RctmonResult};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::Writer,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Tracing target used for hex dumps of every byte chunk sent to or received from the device
pub const FRAME_TARGET: &str = "rctmon::frames";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809000Z [INFO] Connected to inverter`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        // Frame dumps carry their own target so they stay greppable in mixed output
        if event.metadata().target() == FRAME_TARGET {
            write!(writer, "frames: ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the lifetime of the process
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the crate-level filter directive and log file prefix
    pub service_name: String,
    /// Verbose mode (`-d/--debug`)
    pub debug: bool,
    /// Dump raw wire traffic (`--frame-debug`)
    pub frame_debug: bool,
    /// Directory for daily rolling log files; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "rctmon".to_string(),
            debug: false,
            frame_debug: false,
            log_dir: None,
            enable_json: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Build the `EnvFilter` directive string
    ///
    /// `RUST_LOG` (passed in as `rust_log`) replaces the level defaults but frame
    /// debugging is still appended when requested.
    pub fn filter_directive(&self, rust_log: Option<&str>) -> String {
        let mut directive = match rust_log {
            Some(env) if !env.trim().is_empty() => env.trim().to_string(),
            _ if self.debug => format!("info,{}=debug", self.service_name),
            _ => "info".to_string(),
        };

        if self.frame_debug {
            directive.push_str(&format!(",{}=trace", FRAME_TARGET));
        }

        directive
    }
}

/// Initialize the global subscriber
pub fn init_with_config(config: LogConfig) -> RctmonResult<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = config.filter_directive(rust_log.as_deref());
    let env_filter = EnvFilter::try_new(&directive).map_err(|e| {
        RctmonError::StartupFailed(format!("invalid log filter '{}': {}", directive, e))
    })?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| RctmonError::StartupFailed(format!("logging already initialized: {}", e)))?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?} ({})", config.service_name, dir, directive),
        None => tracing::info!("Logging: {} to console ({})", config.service_name, directive),
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        let config = LogConfig::default();
        assert_eq!(config.filter_directive(None), "info");
    }

    #[test]
    fn test_debug_directive() {
        let config = LogConfig {
            debug: true,
            ..Default::default()
        };
        assert_eq!(config.filter_directive(None), "info,rctmon=debug");
    }

    #[test]
    fn test_frame_debug_appended_to_rust_log() {
        let config = LogConfig {
            frame_debug: true,
            ..Default::default()
        };
        assert_eq!(
            config.filter_directive(Some("warn")),
            "warn,rctmon::frames=trace"
        );
        assert_eq!(
            config.filter_directive(Some("  ")),
            "info,rctmon::frames=trace"
        );
    }

    #[test]
    fn test_init_creates_log_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        let config = LogConfig {
            log_dir: Some(dir.clone()),
            ansi: false,
            ..Default::default()
        };

        init_with_config(config).unwrap();
        tracing::info!("written after init");
        assert!(dir.is_dir());
    }

    #[test]
    fn test_directives_parse() {
        let config = LogConfig {
            debug: true,
            frame_debug: true,
            ..Default::default()
        };
        assert!(EnvFilter::try_new(config.filter_directive(None)).is_ok());
    }
}
