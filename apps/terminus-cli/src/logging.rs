//! Logging initialization.
//!
//! Human-readable output goes to stderr, filtered by `RUST_LOG` (errors
//! only by default). Every session also writes a JSON log to
//! `<logs_dir>/cli/<YYYYMMDD_HHMMSS>.log`, at `info` unless `RUST_LOG`
//! says otherwise.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Subdirectory of the logs directory holding CLI log files.
const LOG_SUBDIR: &str = "cli";

/// Install the global subscriber.
///
/// Returns a [`WorkerGuard`] that must be held until exit so buffered log
/// lines are flushed.
///
/// # Errors
///
/// Returns an error if the log file cannot be created or a subscriber is
/// already installed.
pub fn init_tracing(logs_dir: &Path) -> Result<WorkerGuard> {
    let (writer, guard) = open_log_writer(logs_dir)?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(file_filter),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

/// Create the log file and wrap it in a non-blocking writer.
fn open_log_writer(logs_dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let log_path = build_log_path(logs_dir, SystemTime::now());
    let log_dir = logs_dir.join(LOG_SUBDIR);

    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("failed to create log file: {}", log_path.display()))?;

    Ok(tracing_appender::non_blocking(log_file))
}

/// `<logs_dir>/cli/<YYYYMMDD_HHMMSS>.log`
fn build_log_path(logs_dir: &Path, now: SystemTime) -> PathBuf {
    logs_dir
        .join(LOG_SUBDIR)
        .join(format!("{}.log", format_utc_timestamp(now)))
}

/// Format a [`SystemTime`] as `YYYYMMDD_HHMMSS` in UTC.
fn format_utc_timestamp(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (year, month, day) = civil_from_days(secs / 86_400);
    let rem = secs % 86_400;

    format!(
        "{year:04}{month:02}{day:02}_{:02}{:02}{:02}",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since the Unix epoch to a Gregorian (year, month, day).
///
/// Howard Hinnant's `civil_from_days`, with the era starting on 0000-03-01.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);

    (year as u64, month, day)
}
