use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tokio::time;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ClusterError, Result};

static INIT: Once = Once::new();
const LOG_PREFIX: &str = "swarmkeeper";
const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(86400); // 24 hours

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber: a human-readable console layer plus,
/// when `file_output` is set, a JSON layer on a daily rolling file.
///
/// `RUST_LOG` overrides the configured level. Calling this more than once
/// is a no-op.
pub fn init(config: &LoggingConfig, level: Option<&str>, file_output: bool) -> Result<()> {
    let level = level.unwrap_or(&config.level).to_string();
    let mut outcome = Ok(());

    INIT.call_once(|| {
        outcome = install(config, &level, file_output);
    });
    outcome
}

fn install(config: &LoggingConfig, level: &str, file_output: bool) -> Result<()> {
    let _ = tracing_log::LogTracer::init();

    let console = config.console.then(|| {
        fmt::Layer::new()
            .with_target(true)
            .with_ansi(true)
            .with_writer(std::io::stderr)
            .with_filter(filter(level))
    });

    let file = if file_output {
        fs::create_dir_all(&config.dir)
            .map_err(|e| ClusterError::Config(format!("Failed to create log directory {:?}: {}", config.dir, e)))?;

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(LOG_PREFIX)
            .filename_suffix("log")
            .build(&config.dir)
            .map_err(|e| ClusterError::Config(format!("Failed to create file appender: {}", e)))?;

        Some(
            fmt::Layer::new()
                .json()
                .with_writer(file_appender)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true)
                .with_ansi(false)
                .with_filter(filter(level)),
        )
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ClusterError::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if file_output {
        spawn_log_pruning(config.dir.clone(), config.max_files);
    }
    Ok(())
}

fn spawn_log_pruning(log_dir: PathBuf, max_files: usize) {
    if tokio::runtime::Handle::try_current().is_err() {
        cleanup_old_logs(&log_dir, max_files);
        return;
    }
    tokio::spawn(async move {
        let mut interval = time::interval(LOG_ROTATION_INTERVAL);
        loop {
            interval.tick().await;
            cleanup_old_logs(&log_dir, max_files);
        }
    });
}

/// Remove rotated log files beyond the newest `max_files`.
pub fn cleanup_old_logs(log_dir: &Path, max_files: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();

    // Sort by modification time (newest first)
    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    let mut removed = 0;
    for old_file in log_files.iter().skip(max_files) {
        if fs::remove_file(old_file.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
