//! Logging utilities
//!
//! Tracing subscriber setup plus a size-based rolling file writer for the
//! optional JSON log file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default maximum log file size (10MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default maximum number of files kept, the live one included
pub const DEFAULT_MAX_FILES: usize = 5;

/// A size-based rolling file writer
///
/// Files are named with a numeric suffix (`dispatch.log`, `dispatch.log.1`,
/// ...). The oldest file is deleted once `max_files` is reached.
#[derive(Debug, Clone)]
pub struct RollingLogWriter {
    inner: Arc<Mutex<RollingState>>,
}

#[derive(Debug)]
struct RollingState {
    base_path: PathBuf,
    file: Option<File>,
    current_size: u64,
    max_size: u64,
    max_files: usize,
}

impl RollingLogWriter {
    pub fn new(path: impl AsRef<Path>, max_size: u64, max_files: usize) -> io::Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if base_path.file_name().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("log path '{}' has no file name", base_path.display()),
            ));
        }

        if let Some(parent) = base_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let current_size = fs::metadata(&base_path).map(|m| m.len()).unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&base_path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(RollingState {
                base_path,
                file: Some(file),
                current_size,
                max_size,
                max_files: max_files.max(1),
            })),
        })
    }

    /// 10MB per file, 5 files
    pub fn with_defaults(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(path, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_FILES)
    }

    fn state(&self) -> MutexGuard<'_, RollingState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl RollingState {
    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;

        // dispatch.log.(n-1) is dropped, every other file shifts up by one
        for i in (1..self.max_files).rev() {
            let from = self.rotated_path(i);
            if !from.exists() {
                continue;
            }
            if i + 1 >= self.max_files {
                fs::remove_file(&from).ok();
            } else {
                fs::rename(&from, self.rotated_path(i + 1)).ok();
            }
        }

        if self.max_files > 1 && self.base_path.exists() {
            fs::rename(&self.base_path, self.rotated_path(1))?;
        }

        self.file = Some(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.base_path)?,
        );
        self.current_size = 0;
        Ok(())
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut name = self.base_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}", index));
        self.base_path.with_file_name(name)
    }
}

impl Write for RollingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();

        if state.current_size > 0 && state.current_size + buf.len() as u64 > state.max_size {
            state.rotate()?;
        }

        match state.file.as_mut() {
            Some(file) => {
                let written = file.write(buf)?;
                state.current_size += written as u64;
                Ok(written)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "Log file not open")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingLogWriter {
    type Writer = RollingLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Install the global subscriber: JSON to stdout, plus a rolling JSON file
/// when `log_file` is set. `RUST_LOG` takes precedence over `log_level`.
pub fn init_tracing(log_level: &str, log_file: Option<&Path>) -> io::Result<()> {
    let console_layer = fmt::layer().json().with_filter(filter(log_level));
    let subscriber = tracing_subscriber::registry().with(console_layer);

    match log_file {
        Some(path) => {
            let writer = RollingLogWriter::with_defaults(path)?;
            let file_layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter(log_level));
            subscriber.with(file_layer).init();
            eprintln!(
                "Logging to file: {} (10MB rotation, max {} files)",
                path.display(),
                DEFAULT_MAX_FILES
            );
        }
        None => subscriber.init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writer_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/logs/dispatch.log");

        let mut writer = RollingLogWriter::with_defaults(&path).unwrap();
        writer.write_all(b"{\"msg\":\"hello\"}\n").unwrap();
        writer.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello"));
    }

    #[test]
    fn test_rotation_keeps_bounded_file_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dispatch.log");
        let mut writer = RollingLogWriter::new(&path, 64, 3).unwrap();

        for i in 0..40 {
            writeln!(writer, "line {:02}: dispatch event payload", i).unwrap();
        }
        writer.flush().unwrap();

        assert!(dir.path().join("dispatch.log.1").exists());
        assert!(dir.path().join("dispatch.log.2").exists());
        assert!(!dir.path().join("dispatch.log.3").exists());

        let newest = fs::read_to_string(&path).unwrap();
        assert!(newest.contains("line 39"));
        assert!(newest.len() as u64 <= 64);
    }

    #[test]
    fn test_existing_file_size_counts_toward_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dispatch.log");
        fs::write(&path, vec![b'x'; 60]).unwrap();

        let mut writer = RollingLogWriter::new(&path, 64, 2).unwrap();
        writer.write_all(b"0123456789\n").unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("dispatch.log.1")).unwrap().len(), 60);
        assert_eq!(fs::read_to_string(&path).unwrap(), "0123456789\n");
    }
}
