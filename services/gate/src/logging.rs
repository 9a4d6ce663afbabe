//! Logging initialization.
//!
//! JSON logs go to stdout, or with a log directory configured, to
//! `<log_dir>/<start time>/gate.log`, rotating to `gate.<n>.log` once a file
//! reaches 32 MiB. In debug mode a compact copy is written to stderr as well.
//!
//! Records are handed to a `tracing_appender` worker thread, so relay tasks
//! never block on the log file. Keep the returned [`LogGuard`] alive until
//! exit; dropping it flushes what is still queued.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Options;

/// Size at which a log file is rotated (32 MiB).
pub const MAX_LOG_BYTES: usize = 32 * 1024 * 1024;

const LOG_STEM: &str = "gate";

/// Log file writer that starts a new numbered file once the current one is full.
struct RotatingWriter {
    dir: PathBuf,
    file: File,
    index: usize,
    bytes_written: usize,
    max_bytes: usize,
}

impl RotatingWriter {
    fn new(dir: &Path, max_bytes: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = open_log(&log_path(dir, 0))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            index: 0,
            bytes_written: 0,
            max_bytes,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        self.file = open_log(&log_path(&self.dir, self.index))?;
        self.bytes_written = 0;
        Ok(())
    }
}

fn log_path(dir: &Path, index: usize) -> PathBuf {
    if index == 0 {
        dir.join(format!("{LOG_STEM}.log"))
    } else {
        dir.join(format!("{LOG_STEM}.{index}.log"))
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A record never spans two files.
        if self.bytes_written > 0 && self.bytes_written + buf.len() > self.max_bytes {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.bytes_written += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Directory for this run's log files.
pub fn run_dir(log_dir: &Path) -> PathBuf {
    log_dir.join(Local::now().format("%Y%m%d%H%M%S").to_string())
}

/// Keeps the background log writer running.
#[must_use = "dropping the guard stops the log writer"]
pub struct LogGuard {
    dir: Option<PathBuf>,
    _worker: WorkerGuard,
}

impl LogGuard {
    /// Directory log files are written to, if any.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

/// Install the global subscriber.
pub fn init(options: &Options) -> Result<LogGuard> {
    // Prefer RUST_LOG, fall back to the configured level.
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&options.log_level))
    };

    let Some(log_dir) = &options.log_dir else {
        let (stdout, worker) = tracing_appender::non_blocking(io::stdout());
        tracing_subscriber::registry()
            .with(filter())
            .with(tracing_subscriber::fmt::layer().json().with_writer(stdout))
            .init();
        return Ok(LogGuard {
            dir: None,
            _worker: worker,
        });
    };

    let dir = run_dir(log_dir);
    let writer = RotatingWriter::new(&dir, MAX_LOG_BYTES)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let (file, worker) = tracing_appender::non_blocking(writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(file)
        .with_filter(filter());

    let stderr_layer = options.debug.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_filter(filter())
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LogGuard {
        dir: Some(dir),
        _worker: worker,
    })
}
