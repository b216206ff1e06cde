//! Tool execution audit trail.
//!
//! Every tool call becomes one [`ToolCallRecord`], appended as a JSON line to
//! `{dir}/{key_filename}.jsonl`. Files are only ever appended to.
//!
//! Security-relevant denials are additionally emitted as `tracing` events with
//! `audit = true` so log pipelines can filter on them.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::ToolOutcome;
use crate::utils;

/// One executed (or refused) tool call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub timestamp: DateTime<Utc>,
    pub session_key: String,
    /// Turn of the session the call belongs to.
    pub turn: u64,
    pub tool: String,
    pub arguments: serde_json::Value,
    /// Result text, cut to the log's size limit.
    pub result: String,
    pub duration_ms: u64,
    pub outcome: ToolOutcome,
}

/// Append-only per-session JSONL log of tool calls.
pub struct AuditLog {
    dir: PathBuf,
    max_result_chars: usize,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, max_result_chars: usize) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(AuditLog {
            dir,
            max_result_chars,
            write_lock: Mutex::new(()),
        })
    }

    pub fn max_result_chars(&self) -> usize {
        self.max_result_chars
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the records of `session_key`.
    pub fn path_for(&self, session_key: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", utils::key_filename(session_key)))
    }

    /// Append a record, truncating its result first.
    pub fn append(&self, mut record: ToolCallRecord) -> std::io::Result<()> {
        record.result = utils::truncate_string(&record.result, self.max_result_chars);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let path = self.path_for(&record.session_key);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        debug!(
            session = %record.session_key,
            tool = %record.tool,
            turn = record.turn,
            "Audit record appended"
        );
        Ok(())
    }

    /// All records of a session, oldest first. Unparsable lines are skipped.
    pub fn read(&self, session_key: &str) -> std::io::Result<Vec<ToolCallRecord>> {
        read_records(&self.path_for(session_key))
    }
}

fn read_records(path: &Path) -> std::io::Result<Vec<ToolCallRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping bad audit line"),
        }
    }
    Ok(records)
}

// ─────────────────────────────────────────────
// Security events
// ─────────────────────────────────────────────

/// Broad category of a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityCategory {
    /// Path traversal or symlink escape.
    PathSecurity,
    /// Shell command blocked.
    ShellSecurity,
    /// Tool or subagent asked for more than it was granted.
    PolicyViolation,
}

impl std::fmt::Display for SecurityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PathSecurity => write!(f, "path_security"),
            Self::ShellSecurity => write!(f, "shell_security"),
            Self::PolicyViolation => write!(f, "policy_violation"),
        }
    }
}

/// Emit a structured security event. Always carries `audit = true`.
pub fn security_event(category: SecurityCategory, tool: &str, detail: &str, blocked: bool) {
    warn!(
        audit = true,
        category = %category,
        tool,
        blocked,
        detail,
        "Security event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(session: &str, turn: u64, result: &str, outcome: ToolOutcome) -> ToolCallRecord {
        ToolCallRecord {
            timestamp: Utc::now(),
            session_key: session.to_string(),
            turn,
            tool: "read_file".to_string(),
            arguments: json!({"path": "notes.md"}),
            result: result.to_string(),
            duration_ms: 3,
            outcome,
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100).unwrap();

        log.append(record("telegram:42", 1, "ok", ToolOutcome::Success)).unwrap();
        log.append(record("telegram:42", 2, "boom", ToolOutcome::Error)).unwrap();
        log.append(record("cli:other", 1, "ok", ToolOutcome::Success)).unwrap();

        let records = log.read("telegram:42").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].turn, 1);
        assert_eq!(records[1].outcome, ToolOutcome::Error);
        assert_eq!(log.read("cli:other").unwrap().len(), 1);
        assert!(log.read("nobody:0").unwrap().is_empty());
    }

    #[test]
    fn test_result_is_truncated() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 20).unwrap();
        let long = "x".repeat(500);

        log.append(record("cli:1", 1, &long, ToolOutcome::Success)).unwrap();

        let records = log.read("cli:1").unwrap();
        assert_eq!(records[0].result.chars().count(), 20);
        assert!(records[0].result.ends_with("..."));
    }

    #[test]
    fn test_one_json_object_per_line() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100).unwrap();
        log.append(record("cli:1", 1, "line one\nline two", ToolOutcome::Success))
            .unwrap();
        log.append(record("cli:1", 1, "again", ToolOutcome::Success)).unwrap();

        let content = std::fs::read_to_string(log.path_for("cli:1")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["tool"], "read_file");
        assert_eq!(first["arguments"]["path"], "notes.md");
        assert_eq!(first["outcome"], "success");
        assert!(first["duration_ms"].is_u64());
        assert!(first["timestamp"].is_string());
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempdir().unwrap();
        let log = std::sync::Arc::new(AuditLog::new(dir.path(), 5000).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let payload = i.to_string().repeat(1000);
                        log.append(record("cli:busy", 1, &payload, ToolOutcome::Success))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(log.read("cli:busy").unwrap().len(), 160);
    }

    #[test]
    fn test_similar_keys_get_separate_logs() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100).unwrap();

        log.append(record("telegram:42#a:b", 1, "colon", ToolOutcome::Success))
            .unwrap();
        log.append(record("telegram:42#a_b", 1, "underscore", ToolOutcome::Success))
            .unwrap();

        assert_ne!(log.path_for("telegram:42#a:b"), log.path_for("telegram:42#a_b"));
        let colon = log.read("telegram:42#a:b").unwrap();
        assert_eq!(colon.len(), 1);
        assert_eq!(colon[0].result, "colon");
        assert_eq!(log.read("telegram:42#a_b").unwrap()[0].result, "underscore");
    }

}
