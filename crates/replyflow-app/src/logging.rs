use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "replyflow-";
pub const LOG_FILE_SUFFIX: &str = ".log";
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 14;

pub fn log_dir(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("logs")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the process-wide subscriber writing to hourly files under
/// `<runtime_dir>/logs`. `RUST_LOG` overrides the default `info` level.
pub fn init_logging(runtime_dir: &Path, retention_days: i64) -> Result<()> {
    let dir = log_dir(runtime_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    cleanup_old_logs(&dir, Utc::now(), retention_days)?;

    let writer = HourlyLogWriter::new(dir, retention_days, Utc::now())?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_target(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))?;

    Ok(())
}

/// Console logging for CLI subcommands.
pub fn init_console_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

#[derive(Debug)]
struct HourlyState {
    current_hour_key: String,
    file: File,
}

#[derive(Clone, Debug)]
struct HourlyLogWriter {
    log_dir: PathBuf,
    retention_days: i64,
    state: Arc<Mutex<HourlyState>>,
}

impl HourlyLogWriter {
    fn new(log_dir: PathBuf, retention_days: i64, now: DateTime<Utc>) -> Result<Self> {
        let key = hour_key(now);
        let file = open_log_file(&log_dir, &key)
            .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;
        Ok(Self {
            log_dir,
            retention_days,
            state: Arc::new(Mutex::new(HourlyState {
                current_hour_key: key,
                file,
            })),
        })
    }

    fn write_at(&self, now: DateTime<Utc>, buf: &[u8]) -> io::Result<usize> {
        let now_key = hour_key(now);
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("failed to lock log writer"))?;

        if state.current_hour_key != now_key {
            state.file.flush()?;
            state.file = open_log_file(&self.log_dir, &now_key)?;
            state.current_hour_key = now_key;
            let _ = cleanup_old_logs(&self.log_dir, now, self.retention_days);
        }

        state.file.write(buf)
    }
}

impl<'a> MakeWriter<'a> for HourlyLogWriter {
    type Writer = HourlyLogGuard;

    fn make_writer(&'a self) -> Self::Writer {
        HourlyLogGuard {
            writer: self.clone(),
        }
    }
}

struct HourlyLogGuard {
    writer: HourlyLogWriter,
}

impl Write for HourlyLogGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write_at(Utc::now(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .writer
            .state
            .lock()
            .map_err(|_| io::Error::other("failed to lock log writer"))?;
        state.file.flush()
    }
}

fn hour_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

fn log_file_path(log_dir: &Path, hour: &str) -> PathBuf {
    log_dir.join(format!("{LOG_FILE_PREFIX}{hour}{LOG_FILE_SUFFIX}"))
}

fn open_log_file(log_dir: &Path, hour: &str) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(log_dir, hour))
}

pub fn cleanup_old_logs(log_dir: &Path, now: DateTime<Utc>, retention_days: i64) -> Result<()> {
    let cutoff = now - Duration::days(retention_days);
    for path in list_log_files_sorted(log_dir)? {
        let Some(log_time) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(parse_log_filename_time)
        else {
            continue;
        };
        if log_time < cutoff {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

fn parse_log_filename_time(file_name: &str) -> Option<DateTime<Utc>> {
    let body = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let naive =
        NaiveDateTime::parse_from_str(&format!("{body}:00:00"), "%Y-%m-%d-%H:%M:%S").ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

pub fn list_log_files_sorted(log_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match fs::read_dir(log_dir) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", log_dir.display())),
    };
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if parse_log_filename_time(name).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Tail across hourly files, oldest file first. Backs `replyflow logs`.
pub fn read_last_lines_from_logs(log_dir: &Path, max_lines: usize) -> Result<Vec<String>> {
    let mut queue: VecDeque<String> = VecDeque::new();
    for file in list_log_files_sorted(log_dir)? {
        let content = fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        for line in content.lines() {
            queue.push_back(line.to_string());
            if queue.len() > max_lines {
                queue.pop_front();
            }
        }
    }
    Ok(queue.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_dir() -> PathBuf {
        std::env::temp_dir().join(format!("replyflow_logging_test_{}", Uuid::new_v4()))
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_parse_log_filename_time() {
        assert!(parse_log_filename_time("replyflow-2026-02-08-10.log").is_some());
        assert!(parse_log_filename_time("replyflow-2026-02-08.log").is_none());
        assert!(parse_log_filename_time("other-2026-02-08-10.log").is_none());
    }

    #[test]
    fn test_cleanup_old_logs_keeps_recent_removes_old() {
        let dir = test_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("replyflow-2025-01-01-00.log"), "old").unwrap();
        fs::write(dir.join("replyflow-2026-02-08-10.log"), "new").unwrap();
        fs::write(dir.join("notes.txt"), "keep").unwrap();

        cleanup_old_logs(&dir, at("2026-02-08T11:00:00Z"), 14).unwrap();

        assert!(!dir.join("replyflow-2025-01-01-00.log").exists());
        assert!(dir.join("replyflow-2026-02-08-10.log").exists());
        assert!(dir.join("notes.txt").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_writer_rotates_on_hour_change() {
        let dir = test_dir();
        fs::create_dir_all(&dir).unwrap();
        let writer = HourlyLogWriter::new(dir.clone(), 14, at("2026-02-08T10:59:00Z")).unwrap();
        writer.write_at(at("2026-02-08T10:59:30Z"), b"first\n").unwrap();
        writer.write_at(at("2026-02-08T11:00:01Z"), b"second\n").unwrap();
        drop(writer);

        let files = list_log_files_sorted(&dir).unwrap();
        assert_eq!(files.len(), 2);
        let lines = read_last_lines_from_logs(&dir, 10).unwrap();
        assert_eq!(lines, vec!["first", "second"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_read_last_lines_from_logs() {
        let dir = test_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("replyflow-2026-02-08-09.log"), "a\nb\n").unwrap();
        fs::write(dir.join("replyflow-2026-02-08-10.log"), "c\nd\n").unwrap();

        let lines = read_last_lines_from_logs(&dir, 3).unwrap();
        assert_eq!(lines, vec!["b", "c", "d"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_dir_lists_nothing() {
        let dir = test_dir();
        assert!(list_log_files_sorted(&dir).unwrap().is_empty());
        assert!(cleanup_old_logs(&dir, Utc::now(), 1).is_ok());
    }
}
