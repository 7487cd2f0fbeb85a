//! Per-run audit log.
//!
//! One file per run, one line per entry, flushed as soon as it is written
//! so the file survives an interrupted run.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Entry category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditLevel::Info => write!(f, "INFO"),
            AuditLevel::Success => write!(f, "SUCCESS"),
            AuditLevel::Warning => write!(f, "WARNING"),
            AuditLevel::Error => write!(f, "ERROR"),
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
    file: File,
    warnings: u32,
    errors: u32,
}

impl AuditLog {
    /// Create `flash_<timestamp>.log` inside `dir`.
    pub fn create(dir: &Path, started: DateTime<Utc>) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("flash_{}.log", started.format("%Y%m%d_%H%M%S_%3f")));
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file,
            warnings: 0,
            errors: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Append one entry.
    ///
    /// Write failures are reported through tracing and otherwise ignored:
    /// losing the log must not turn a recoverable run into a failed one.
    pub fn record(&mut self, level: AuditLevel, message: impl AsRef<str>) {
        match level {
            AuditLevel::Warning => self.warnings += 1,
            AuditLevel::Error => self.errors += 1,
            AuditLevel::Info | AuditLevel::Success => {}
        }
        self.write_line(level, message.as_ref());
    }

    fn write_line(&mut self, level: AuditLevel, message: &str) {
        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            message
        );
        if let Err(e) = self
            .file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
        {
            tracing::error!(path = %self.path.display(), error = %e, "Audit write failed");
        }
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.record(AuditLevel::Info, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.record(AuditLevel::Error, message);
    }

    /// Final entry: duration, counts and verdict.
    pub fn finish(&mut self, success: bool, elapsed: Duration) {
        let verdict = if success { "PASS" } else { "FAIL" };
        let level = if success {
            AuditLevel::Success
        } else {
            AuditLevel::Error
        };
        let summary = format!(
            "Run finished: {} in {:.1}s ({} warnings, {} errors)",
            verdict,
            elapsed.as_secs_f64(),
            self.warnings,
            self.errors
        );
        self.write_line(level, &summary);
        if let Err(e) = self.file.sync_all() {
            tracing::warn!(error = %e, "Audit sync failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_visible_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::create(dir.path(), Utc::now()).unwrap();
        log.info("starting");
        log.record(AuditLevel::Warning, "only one backup");

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] starting"));
        assert!(lines[1].contains("[WARNING] only one backup"));
        assert_eq!(log.warnings(), 1);
    }

    #[test]
    fn test_finish_records_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::create(dir.path(), Utc::now()).unwrap();
        log.error("block 5 failed");
        log.finish(false, Duration::from_millis(2500));

        let text = fs::read_to_string(log.path()).unwrap();
        let last = text.lines().last().unwrap();
        assert!(last.contains("[ERROR] Run finished: FAIL in 2.5s (0 warnings, 1 errors)"));
    }
}
