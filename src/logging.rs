//! Logging setup: console output plus an append-only log file.
//!
//! Errors that stop the process are logged with `critical = true`.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Local wall-clock timestamp, `2024-01-31 12:00:00`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTimestamp;

impl FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Open `path` for appending, creating its parent directory first.
pub fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
///
/// If the log file cannot be opened the server still runs, logging to
/// the console only.
pub fn init(level: &str, log_file: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (file_layer, file_error) = match open_log_file(log_file) {
        Ok(file) => {
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_timer(LocalTimestamp)
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_timer(LocalTimestamp))
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        warn!(path = %log_file.display(), error = %e, "Cannot open log file, logging to console only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_log_file_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("nested").join("vcalc.log");

        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "first").unwrap();
        drop(file);

        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "second").unwrap();
        drop(file);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn test_timestamp_format() {
        let mut out = String::new();
        LocalTimestamp.format_time(&mut Writer::new(&mut out)).unwrap();
        assert_eq!(out.len(), "2024-01-31 12:00:00".len());
        assert_eq!(&out[4..5], "-");
        assert_eq!(&out[10..11], " ");
    }
}
