//! Tracing subscriber setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "vtube_bridge=info,warn";
const LOG_FILE_NAME: &str = "bridge.log";
const ROTATE_KEEP: u32 = 3;

/// Where log lines go.
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Human-readable lines on stderr (stdout stays free for results).
    Stderr,
    /// `bridge.log` in the given directory, rotated at startup.
    File(PathBuf),
}

impl LogTarget {
    /// `bridge.log` under the platform data directory.
    pub fn default_file() -> Self {
        LogTarget::File(data_dir())
    }
}

/// Return the platform-standard data directory for the bridge.
///
/// Falls back to `~/.vtube-bridge/` if the platform directory cannot be
/// resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("vtube-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vtube-bridge")
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Falls back to stderr when the log file cannot be opened. Calling this
/// twice is harmless; the second call is ignored.
pub fn init_tracing(target: LogTarget) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match target {
        LogTarget::Stderr => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init();
        }
        LogTarget::File(dir) => {
            let log_path = dir.join(LOG_FILE_NAME);
            let file = std::fs::create_dir_all(&dir).and_then(|()| {
                rotate_log_file(&log_path, ROTATE_KEEP);
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
            });

            match file {
                Ok(file) => {
                    let _ = fmt::fmt()
                        .with_env_filter(filter)
                        .with_writer(FlushingWriter::new(file))
                        .with_ansi(false)
                        .with_target(true)
                        .try_init();
                    tracing::info!(
                        version = env!("CARGO_PKG_VERSION"),
                        log_file = %log_path.display(),
                        pid = std::process::id(),
                        "=== vtube-bridge starting ==="
                    );
                }
                Err(e) => {
                    let _ = fmt::fmt()
                        .with_env_filter(filter)
                        .with_writer(std::io::stderr)
                        .try_init();
                    tracing::warn!(path = %log_path.display(), error = %e, "cannot open log file, logging to stderr");
                }
            }
        }
    }
}

/// Rotate log files: `bridge.log` → `bridge.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that flushes the log file after every write, so lines survive
/// a crash of the host process.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        for (suffix, body) in [("", "current"), (".1", "one"), (".2", "two"), (".3", "three")] {
            std::fs::write(format!("{}{suffix}", base.display()), body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| std::fs::read_to_string(format!("{}{suffix}", base.display())).unwrap();
        assert_eq!(read(".1"), "current");
        assert_eq!(read(".2"), "one");
        assert_eq!(read(".3"), "two");
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_data_dir_is_named_for_the_bridge() {
        let dir = data_dir();
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap();
        assert!(name == "vtube-bridge" || name == ".vtube-bridge");
    }
}
