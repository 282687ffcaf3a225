//! Logging infrastructure - structured tracing across the binding engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - `trace!` for individual marshaling decisions
//! - `debug!` for wrapper and closure lifecycle
//! - `warn!` for advisory native errors and swallowed callback failures
//! - `error!` for programming errors detected at the boundary
//!
//! Initialization is idempotent and optional; embedders that install their
//! own subscriber simply never call [`init`].

use crate::config::LoggingConfig;
use crate::descriptor::{Transfer, TypeDescriptor};
use once_cell::sync::OnceCell;
use std::io;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path; console output when unset
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // GIBIND_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("GIBIND_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        if let Ok(path) = std::env::var("GIBIND_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("GIBIND_LOG_JSON").is_ok();
        config.show_spans = std::env::var("GIBIND_LOG_SPANS").is_ok();

        config
    }

    /// Build from the `[logging]` section of a `BindConfig`
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        Self {
            level: parse_level(&settings.level),
            log_path: settings.file.clone(),
            json_format: settings.json,
            show_spans: settings.spans,
        }
    }

    /// Create high-performance config (minimal logging)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: Some("gibind.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration taken from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// A subscriber installed elsewhere wins; this call then only marks logging
/// as initialized.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("gibind={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match &config.log_path {
            Some(path) => {
                let path = std::path::Path::new(path);
                let directory = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| "gibind.log".into());
                tracing_appender::non_blocking(tracing_appender::rolling::never(
                    directory, file_name,
                ))
            }
            None => tracing_appender::non_blocking(io::stderr()),
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions));

        let installed = if config.json_format {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init()
        };

        installed.ok().map(|_| guard)
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Engine-specific logging functions
// ============================================================================

/// Log a native call about to be dispatched
#[inline]
pub fn log_native_call(callable: &str, arg_count: usize) {
    use tracing::debug;
    debug!(
        event = "native_call",
        callable = callable,
        args = arg_count,
        "Native function called"
    );
}

/// Log return from a native call
#[inline]
pub fn log_native_return(callable: &str, results: usize) {
    use tracing::trace;
    trace!(
        event = "native_return",
        callable = callable,
        results = results,
        "Native function returned"
    );
}

/// Log a single marshaling decision
#[inline]
pub fn log_marshal(direction: &'static str, ty: &TypeDescriptor, transfer: Transfer) {
    use tracing::trace;
    if tracing::enabled!(Level::TRACE) {
        trace!(
            event = "marshal",
            direction = direction,
            ty = %ty,
            transfer = transfer.as_str(),
            "Value marshaled"
        );
    }
}

/// Log native memory allocated by the engine
#[inline]
pub fn log_allocation(size: usize, address: usize) {
    use tracing::trace;
    trace!(
        event = "allocation",
        size_bytes = size,
        address = format_args!("{:#x}", address),
        "Native memory allocated"
    );
}

/// Log a compound wrapper lifecycle transition
#[inline]
pub fn log_wrapper_event(action: &'static str, type_name: &str, address: usize, posture: &'static str) {
    use tracing::debug;
    debug!(
        event = "wrapper",
        action = action,
        ty = type_name,
        address = format_args!("{:#x}", address),
        posture = posture,
        "Compound wrapper {}", action
    );
}

/// Log a closure lifecycle transition
#[inline]
pub fn log_closure_event(action: &'static str, callable: &str) {
    use tracing::debug;
    debug!(
        event = "closure",
        action = action,
        callable = callable,
        "Closure {}", action
    );
}

/// Log an error swallowed at a callback boundary
pub fn log_callback_error(callable: &str, error: &str) {
    use tracing::warn;
    warn!(
        event = "callback_error",
        callable = callable,
        error = error,
        "Error raised inside callback could not be propagated"
    );
}

/// Log a native error reported through an advisory channel
pub fn log_advisory_error(callable: &str, error: &str) {
    use tracing::warn;
    warn!(
        event = "advisory_error",
        callable = callable,
        error = error,
        "Native call reported advisory error"
    );
}

/// Log a misuse of the engine detected at runtime
pub fn log_programming_error(context: &str, error: &str) {
    use tracing::error;
    error!(
        event = "programming_error",
        context = context,
        error = error,
        "Engine misuse detected"
    );
}
