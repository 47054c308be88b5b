use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::error::{Error, Result};
use crate::executor::{ExecEvent, ExecSink, LogLevel};
use crate::log_sanitize::sanitize_log_line;

/// Append-only run log: one `[YYYY-mm-dd HH:MM:SS] [LEVEL] message` line per event.
pub struct RunLogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLogSink {
    /// Create `deploy_<YYYYmmdd_HHMMSS>.log` inside `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::msg(format!("create log directory {} failed: {e}", dir.display()))
        })?;
        let name = format!("deploy_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
        Self::open(&dir.join(name))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::msg(format!("open run log {} failed: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a failure that happened before any stage could start.
    pub fn setup_failed(&self, err: &Error, secrets: &[String]) {
        let line = format!("deployment aborted before the first stage: {err}");
        self.write_line(LogLevel::Error, &sanitize_log_line(&line, secrets));
    }

    fn write_line(&self, level: LogLevel, msg: &str) {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        let Ok(mut f) = self.file.lock() else {
            return;
        };
        if let Err(e) = writeln!(f, "[{ts}] [{}] {msg}", level.label()) {
            tracing::warn!(path = %self.path.display(), error = %e, "run log write failed");
        }
    }
}

impl ExecSink for RunLogSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id, label } => {
                self.write_line(LogLevel::Info, &format!("==> {label} ({id})"))
            }
            ExecEvent::TaskLog { level, line, .. } => self.write_line(level, &line),
            ExecEvent::TaskFinished {
                id,
                ok: true,
                elapsed_ms,
                ..
            } => self.write_line(LogLevel::Info, &format!("{id} done in {elapsed_ms}ms")),
            ExecEvent::TaskFinished {
                id,
                error,
                elapsed_ms,
                ..
            } => self.write_line(
                LogLevel::Error,
                &format!(
                    "{id} failed after {elapsed_ms}ms: {}",
                    error.unwrap_or_default()
                ),
            ),
            ExecEvent::ExecutorDone { ok: true, .. } => {
                self.write_line(LogLevel::Info, "deployment finished")
            }
            ExecEvent::ExecutorDone { error, .. } => self.write_line(
                LogLevel::Error,
                &format!("deployment aborted: {}", error.unwrap_or_default()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_timestamp_and_level() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = RunLogSink::create(tmp.path()).expect("create");
        let name = sink
            .path()
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap()
            .to_string();
        assert!(name.starts_with("deploy_") && name.ends_with(".log"), "{name}");
        assert_eq!(name.len(), "deploy_20240101_120000.log".len());

        sink.emit(ExecEvent::TaskLog {
            id: "host.probe".into(),
            level: LogLevel::Warn,
            line: "slow handshake".into(),
        });
        sink.emit(ExecEvent::ExecutorDone {
            ok: false,
            error: Some("transport error: boom".into()),
        });

        let text = std::fs::read_to_string(sink.path()).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert_eq!(&lines[0][20..], "] [WARN] slow handshake");
        assert!(lines[1].ends_with("[ERROR] deployment aborted: transport error: boom"));
    }

    #[test]
    fn setup_failures_are_logged_redacted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = RunLogSink::create(tmp.path()).expect("create");
        let err = Error::input("bad value ghp_abc near line 3");
        sink.setup_failed(&err, &["ghp_abc".to_string()]);

        let text = std::fs::read_to_string(sink.path()).expect("read log");
        assert!(text.contains("[ERROR] deployment aborted before the first stage: "), "{text}");
        assert!(!text.contains("ghp_abc"));
    }
}
