use crate::error::Result;
use crate::models::PoolStats;
use chrono::Utc;
use log::{debug, error, info, trace, warn, LevelFilter};
use std::sync::Once;
use tracing::Level;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

/// Initialize the global logger, filtered by `RUST_LOG`.
/// Only the first init call in a process has effect.
pub fn init_logger() {
    INIT.call_once(|| {
        FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_level(true)
            .with_ansi(true)
            .init();

        // Bridge log records to tracing once the subscriber is in place
        bridge_log_records();
        log::set_max_level(LevelFilter::Debug);
    });
}

/// Initialize logger with a fixed maximum level
pub fn init_logger_with_level(level: Level) {
    INIT.call_once(|| {
        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_level(true)
            .with_ansi(true)
            .init();

        bridge_log_records();
        log::set_max_level(level_filter(level));
    });
}

/// Initialize logger from `RUST_LOG`, defaulting to info
pub fn init_logger_with_env() {
    INIT.call_once(|| {
        let level = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string())
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::Info);
        log::set_max_level(level);

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
            .init();

        bridge_log_records();
    });
}

fn bridge_log_records() {
    if let Err(e) = LogTracer::init() {
        eprintln!("Warning: Failed to initialize LogTracer: {:?}", e);
    }
}

fn level_filter(level: Level) -> LevelFilter {
    match level {
        Level::ERROR => LevelFilter::Error,
        Level::WARN => LevelFilter::Warn,
        Level::INFO => LevelFilter::Info,
        Level::DEBUG => LevelFilter::Debug,
        Level::TRACE => LevelFilter::Trace,
    }
}

/// Log a pool stats snapshot as JSON at debug level
pub fn log_pool_stats(stats: &PoolStats) -> Result<()> {
    let timestamp = Utc::now().to_rfc3339();
    let body = serde_json::to_string_pretty(stats)?;
    debug!(
        "[{}] POOL STATS (reuse ratio {:.2}):\n{}",
        timestamp,
        stats.reuse_ratio(),
        body
    );
    Ok(())
}

/// Log an error message
pub fn log_error(message: &str) {
    error!("{}", message);
}

/// Log an info message
pub fn log_info(message: &str) {
    info!("{}", message);
}

/// Log a warning message
pub fn log_warning(message: &str) {
    warn!("{}", message);
}

/// Log a debug message
pub fn log_debug(message: &str) {
    debug!("{}", message);
}

/// Log a trace message
pub fn log_trace(message: &str) {
    trace!("{}", message);
}

/// Log pool stats, reporting serialization failures on stderr
#[macro_export]
macro_rules! log_pool_stats {
    ($stats:expr) => {
        if let Err(e) = $crate::logging::log_pool_stats($stats) {
            eprintln!("Failed to log pool stats: {}", e);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_trace(&format!($($arg)*));
    };
}
