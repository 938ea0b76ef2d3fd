//! Append-only, human-readable event log.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::Local;
use tracing::warn;

/// Writes one `[YYYY-MM-DD HH:MM:SS] message` line per event.
///
/// A log that cannot be opened or written degrades to a no-op after a
/// single warning; the trace itself never fails because of it.
#[derive(Debug)]
pub struct EventLog {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                file: Some(file),
                path: Some(path.to_path_buf()),
            },
            Err(e) => {
                warn!("cannot open log file {}: {}, continuing without it", path.display(), e);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { file: None, path: None }
    }

    pub fn record(&mut self, message: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = write_line(file, message) {
            let path = self.path.as_deref().unwrap_or(Path::new("log"));
            warn!("writing to {} failed: {}, disabling it", path.display(), e);
            self.file = None;
        }
    }
}

fn write_line(out: &mut impl Write, message: &str) -> io::Result<()> {
    writeln!(out, "[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hoptrace-{}-{}", std::process::id(), name))
    }

    fn is_timestamped(line: &str) -> bool {
        let bytes = line.as_bytes();
        bytes.len() > 22
            && bytes[0] == b'['
            && bytes[5] == b'-'
            && bytes[11] == b' '
            && bytes[14] == b':'
            && bytes[20] == b']'
            && bytes[21] == b' '
    }

    #[test]
    fn test_lines_are_timestamped_and_appended() {
        let path = temp_path("append.log");
        let _ = fs::remove_file(&path);

        let mut log = EventLog::open(&path);
        assert!(log.file.is_some());
        log.record("first");
        drop(log);

        let mut log = EventLog::open(&path);
        log.record(" 2  * request timed out");
        drop(log);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| is_timestamped(line)), "{contents}");
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("]  2  * request timed out"));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_unopenable_log_is_disabled() {
        let path = temp_path("missing-dir").join("nested").join("trace.log");
        let mut log = EventLog::open(&path);
        assert!(log.file.is_none());
        assert!(log.path.is_none());
        log.record("dropped silently");
    }

    #[test]
    fn test_write_line_format() {
        let mut buffer = Vec::new();
        write_line(&mut buffer, "destination reached").unwrap();
        let line = String::from_utf8(buffer).unwrap();
        assert!(is_timestamped(&line));
        assert!(line.ends_with("] destination reached\n"));
    }
}
