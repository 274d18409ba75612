//! Logging initialization.
//!
//! Logs always go to stderr, which supervisord collects. When a log file is
//! configured, JSON logs are written there as well. The file rolls over to
//! `<name>.1` once it reaches the size limit, so it holds at most the last
//! two limits' worth of records.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Size at which the log file rolls over (1 MiB).
const ROLL_OVER_BYTES: u64 = 1024 * 1024;

/// Appending log file with a single rolled-over predecessor.
struct RollingFile {
    path: PathBuf,
    previous: PathBuf,
    file: File,
    size: u64,
    limit: u64,
}

impl RollingFile {
    fn open(path: &Path, limit: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        let mut previous = path.as_os_str().to_owned();
        previous.push(".1");

        Ok(Self {
            path: path.to_path_buf(),
            previous: PathBuf::from(previous),
            file,
            size,
            limit,
        })
    }

    fn roll_over(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, &self.previous)?;
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Each formatted record arrives in one call; records never straddle files
        if self.size > 0 && self.size + buf.len() as u64 > self.limit {
            self.roll_over()?;
        }
        self.file.write_all(buf)?;
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct SharedLog(Mutex<RollingFile>);

impl Write for &SharedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedLog {
    type Writer = &'static SharedLog;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Initialize logging. `RUST_LOG` overrides the default `info` filter.
pub fn init(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = RollingFile::open(path, ROLL_OVER_BYTES)?;
            // Lives as long as the global subscriber
            let shared: &'static SharedLog = Box::leak(Box::new(SharedLog(Mutex::new(file))));
            Some(tracing_subscriber::fmt::layer().json().with_writer(shared))
        }
        None => None,
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rolls_over_at_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/updater.log");

        let mut log = RollingFile::open(&path, 100).unwrap();
        log.write_all(&[b'a'; 60]).unwrap();
        log.write_all(&[b'b'; 30]).unwrap();
        // Would exceed the limit: current contents move aside
        log.write_all(&[b'c'; 40]).unwrap();
        log.flush().unwrap();

        let previous = dir.path().join("logs/updater.log.1");
        assert_eq!(fs::read(&previous).unwrap().len(), 90);
        assert_eq!(fs::read(&path).unwrap(), vec![b'c'; 40]);

        // Only one predecessor is kept
        log.write_all(&[b'd'; 80]).unwrap();
        log.flush().unwrap();
        assert_eq!(fs::read(&previous).unwrap(), vec![b'c'; 40]);
        assert_eq!(fs::read(&path).unwrap(), vec![b'd'; 80]);
    }

    #[test]
    fn test_reopen_appends_to_existing_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater.log");
        fs::write(&path, b"earlier run\n").unwrap();

        let mut log = RollingFile::open(&path, 1024).unwrap();
        log.write_all(b"this run\n").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "earlier run\nthis run\n");
    }

    #[test]
    fn test_oversized_record_still_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater.log");

        let mut log = RollingFile::open(&path, 10).unwrap();
        log.write_all(&[b'x'; 25]).unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read(&path).unwrap().len(), 25);
        assert!(!dir.path().join("updater.log.1").exists());
    }
}
