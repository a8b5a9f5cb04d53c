// src/logging.rs
//
// Operational log: `tlog!` lines on stderr stamped with local wall-clock
// time, copied into a log file while one is open.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Timestamped logging macro.
/// `tlog!("[area] message {}", x)` writes `HH:MM:SS.mmm [area] message ..`.
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}

/// Symlink kept pointing at the newest log file (Unix only)
const LATEST_LINK: &str = "onionlog.log";

struct LogFile {
    file: File,
    path: PathBuf,
}

static LOG_FILE: Mutex<Option<LogFile>> = Mutex::new(None);

fn log_file() -> MutexGuard<'static, Option<LogFile>> {
    LOG_FILE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn stamp() -> impl std::fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Write one line to stderr and, when file logging is on, to the file.
pub(crate) fn emit(message: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", stamp(), message);
    eprintln!("{}", line);
    if let Some(log) = log_file().as_mut() {
        let _ = writeln!(log.file, "{}", line);
    }
}

/// Start copying log lines into a new `<timestamp>-onionlog.log` in `log_dir`.
/// Returns the path of the file opened.
pub(crate) fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Cannot create log dir {}: {}", log_dir.display(), e))?;

    let name = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-onionlog.log")
        .to_string();
    let path = log_dir.join(&name);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Cannot open log file {}: {}", path.display(), e))?;

    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&name, &link) {
            tlog!("[logging] Could not update {}: {}", LATEST_LINK, e);
        }
    }

    *log_file() = Some(LogFile {
        file,
        path: path.clone(),
    });
    tlog!("[logging] Writing log to {}", path.display());
    Ok(path)
}

/// Close the log file, if any. Later lines go to stderr only.
pub(crate) fn stop_file_logging() {
    let closed = log_file().take();
    if let Some(log) = closed {
        tlog!("[logging] Closed {}", log.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_writes_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_file_logging(&dir.path().join("logs")).unwrap();
        tlog!("[test] hello {}", 42);
        stop_file_logging();
        tlog!("[test] after close");

        assert!(path.file_name().unwrap().to_string_lossy().ends_with("-onionlog.log"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[test] hello 42"));
        assert!(!content.contains("[test] after close"));

        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(dir.path().join("logs").join(LATEST_LINK)).unwrap(),
            PathBuf::from(path.file_name().unwrap())
        );
    }
}
