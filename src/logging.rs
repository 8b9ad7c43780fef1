use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tokio::time;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{CoordError, Result};

static INIT: Once = Once::new();
const MAX_LOG_FILES: usize = 7; // Keep 7 days of logs
const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(86400); // 24 hours

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber: human-readable diagnostics on stderr and,
/// with `log_dir`, JSON lines in a daily rolling file. Only the first call
/// has any effect.
///
/// Must be called inside a tokio runtime when `log_dir` is set.
pub fn init(level: &str, log_dir: Option<PathBuf>) -> Result<()> {
    let mut outcome = Ok(());
    INIT.call_once(|| {
        outcome = install(level, log_dir);
    });
    outcome
}

fn install(level: &str, log_dir: Option<PathBuf>) -> Result<()> {
    let console = fmt::Layer::new()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(true)
        .with_filter(filter(level));

    let file = match &log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|e| {
                CoordError::config(format!("Failed to create log directory {}: {}", dir.display(), e))
            })?;
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("coord-node")
                .filename_suffix("log")
                .build(dir)
                .map_err(|e| CoordError::config(format!("Failed to create log file: {}", e)))?;
            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| CoordError::config(format!("Failed to set tracing subscriber: {}", e)))?;

    if let Some(dir) = log_dir {
        tokio::spawn(async move {
            let mut interval = time::interval(LOG_ROTATION_INTERVAL);
            loop {
                interval.tick().await;
                cleanup_old_logs(&dir);
            }
        });
    }
    Ok(())
}

fn cleanup_old_logs(log_dir: &Path) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == "log")
                    .unwrap_or(false)
            })
            .collect();

        // Newest first
        log_files.sort_by_key(|entry| {
            std::cmp::Reverse(
                entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            )
        });

        for old_file in log_files.iter().skip(MAX_LOG_FILES) {
            let _ = fs::remove_file(old_file.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            let path = dir.path().join(format!("coord-node.{:02}.log", i));
            fs::write(&path, "x").unwrap();
            let mtime = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + i);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        cleanup_old_logs(dir.path());

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), MAX_LOG_FILES + 1);
        assert!(left.contains(&"notes.txt".to_string()));
        assert!(left.contains(&"coord-node.09.log".to_string()));
        assert!(!left.contains(&"coord-node.00.log".to_string()));
    }
}
