//! Tracing setup shared by both binaries.
//!
//! Console output always; an optional append-only file layer under
//! `/var/log/retrowaves/` that survives external log rotation by re-opening
//! the file whenever its inode changes. Logging failures degrade silently.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rotation-tolerant log file writer.
///
/// Re-stats the path on every write; a changed inode (logrotate moved the
/// file away) triggers a re-open. Write errors are swallowed.
pub struct RotatingFileWriter {
    path: PathBuf,
    inner: Mutex<Option<(File, u64)>>,
}

impl RotatingFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(None),
        }
    }

    fn open(&self) -> Option<(File, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .ok()?;
        let ino = file.metadata().ok()?.ino();
        Some((file, ino))
    }

    fn write_line(&self, buf: &[u8]) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };

        let current_ino = std::fs::metadata(&self.path).ok().map(|m| m.ino());
        let reopen = match (&*guard, current_ino) {
            (Some((_, ino)), Some(cur)) => *ino != cur,
            (Some(_), None) => true,
            (None, _) => true,
        };
        if reopen {
            *guard = self.open();
        }

        if let Some((file, _)) = guard.as_mut() {
            if file.write_all(buf).is_err() {
                *guard = None;
            }
        }
    }
}

pub struct FileWriterHandle<'a>(&'a RotatingFileWriter);

impl Write for FileWriterHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_line(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingFileWriter {
    type Writer = FileWriterHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterHandle(self)
    }
}

/// Initialize tracing for one of the two processes.
///
/// `process` selects the log file name (`tower` or `station`). The file
/// layer is skipped entirely when the log directory cannot be created.
pub fn init(process: &str) {
    let directives = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info,retrowaves=debug".into());
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = PathBuf::from("/var/log/retrowaves");
    let file_layer = std::fs::create_dir_all(&log_dir).ok().map(|_| {
        let writer = RotatingFileWriter::new(log_dir.join(format!("{process}.log")));
        tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}
