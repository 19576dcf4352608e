//! Shared logging utilities for Kegwatch binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "kegwatch=info,kegwatch_capture=info,kegwatch_sync=info";
const ROTATED_COPIES: usize = 3;
const MAX_LOG_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// Logging configuration for a Kegwatch binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a size-capped file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let writer = SizeCappedWriter::open(log_dir, config.app_name)
        .context("Failed to open station log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Station home directory: $KEGWATCH_HOME or ~/.kegwatch
pub fn kegwatch_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("KEGWATCH_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kegwatch")
}

pub fn logs_dir() -> PathBuf {
    kegwatch_home().join("logs")
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Appends to `<app>.log`, shifting to `<app>.log.1..N` when the cap is
/// hit. Shared behind a mutex so every tracing layer clone writes to the
/// same file handle.
#[derive(Clone)]
struct SizeCappedWriter {
    inner: Arc<Mutex<LogFile>>,
}

struct LogFile {
    dir: PathBuf,
    base: String,
    file: File,
    written: u64,
}

impl SizeCappedWriter {
    fn open(dir: PathBuf, app_name: &str) -> io::Result<Self> {
        let base = sanitize_name(app_name);
        let path = dir.join(format!("{base}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(Mutex::new(LogFile {
                dir,
                base,
                file,
                written,
            })),
        })
    }
}

impl LogFile {
    fn path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.base))
        } else {
            self.dir.join(format!("{}.log.{index}", self.base))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for index in (0..ROTATED_COPIES).rev() {
            let from = self.path(index);
            if from.exists() {
                fs::rename(&from, self.path(index + 1))?;
            }
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.written = 0;
        Ok(())
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }
}

struct WriterGuard {
    inner: Arc<Mutex<LogFile>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SizeCappedWriter {
    type Writer = WriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        WriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for WriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.file.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_name("keg/watch run"), "keg_watch_run");
        assert_eq!(sanitize_name("station-01"), "station-01");
    }

    #[test]
    fn writer_appends_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SizeCappedWriter::open(dir.path().to_path_buf(), "test").unwrap();
        {
            let mut guard = writer.make_writer();
            guard.write_all(b"hello\n").unwrap();
            guard.flush().unwrap();
        }
        assert!(dir.path().join("test.log").exists());

        // Force a rotation by breaching the cap directly.
        {
            let mut inner = writer.inner.lock().unwrap();
            inner.written = MAX_LOG_FILE_SIZE;
        }
        {
            let mut guard = writer.make_writer();
            guard.write_all(b"after rotate\n").unwrap();
            guard.flush().unwrap();
        }
        assert!(dir.path().join("test.log.1").exists());
        let fresh = fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert_eq!(fresh, "after rotate\n");
    }
}
