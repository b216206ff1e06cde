//! Long-term memory: read-only view of the workspace `memory/` directory.
//!
//! - `memory/MEMORY.md` holds persistent facts and preferences
//! - `memory/YYYY-MM-DD.md` holds the notes of one day
//!
//! The context builder reads memory on every build. The agent writes it
//! through the filesystem tools, never through this type.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::warn;

/// File-based memory inside a workspace.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    memory_dir: PathBuf,
}

impl MemoryStore {
    /// Point at `{workspace}/memory`. Nothing is created on disk.
    pub fn new(workspace: &Path) -> Self {
        Self {
            memory_dir: workspace.join("memory"),
        }
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    pub fn memory_file(&self) -> PathBuf {
        self.memory_dir.join("MEMORY.md")
    }

    /// Path of the daily note for `date`.
    pub fn note_file(&self, date: NaiveDate) -> PathBuf {
        self.memory_dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub fn read_long_term(&self) -> Option<String> {
        read_optional(&self.memory_file())
    }

    pub fn read_note(&self, date: NaiveDate) -> Option<String> {
        read_optional(&self.note_file(date))
    }

    /// The memory section for a prompt built on `date`, or `None` when
    /// there is nothing to say.
    ///
    /// ```text
    /// # Memory
    ///
    /// ## Long-term Memory
    /// <MEMORY.md>
    ///
    /// ## Today's Notes (YYYY-MM-DD)
    /// <YYYY-MM-DD.md>
    /// ```
    pub fn context_for(&self, date: NaiveDate) -> Option<String> {
        let mut sections = Vec::new();

        if let Some(long_term) = self.read_long_term() {
            sections.push(format!("## Long-term Memory\n\n{}", long_term.trim_end()));
        }
        if let Some(note) = self.read_note(date) {
            sections.push(format!(
                "## Today's Notes ({})\n\n{}",
                date.format("%Y-%m-%d"),
                note.trim_end()
            ));
        }

        if sections.is_empty() {
            None
        } else {
            Some(format!("# Memory\n\n{}", sections.join("\n\n")))
        }
    }
}

/// Read a file, treating absence and blank content as nothing.
fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "memory file unreadable, skipping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_no_memory_is_none() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.context_for(date()).is_none());
        assert!(!store.memory_dir().exists());
    }

    #[test]
    fn test_long_term_and_note() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new(dir.path());
        std::fs::create_dir_all(store.memory_dir()).unwrap();
        std::fs::write(store.memory_file(), "User prefers metric units.\n").unwrap();
        std::fs::write(store.memory_dir().join("2026-03-14.md"), "Dentist at 3pm").unwrap();
        std::fs::write(store.memory_dir().join("2026-03-13.md"), "yesterday").unwrap();

        let ctx = store.context_for(date()).unwrap();
        assert!(ctx.starts_with("# Memory"));
        assert!(ctx.contains("## Long-term Memory\n\nUser prefers metric units."));
        assert!(ctx.contains("## Today's Notes (2026-03-14)\n\nDentist at 3pm"));
        assert!(!ctx.contains("yesterday"));
    }

    #[test]
    fn test_blank_memory_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new(dir.path());
        std::fs::create_dir_all(store.memory_dir()).unwrap();
        std::fs::write(store.memory_file(), "  \n").unwrap();
        assert!(store.context_for(date()).is_none());
    }
}
