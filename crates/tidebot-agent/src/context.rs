//! Context builder: turns a session and an inbound message into the
//! conversation the model sees.
//!
//! Sections, highest precedence first:
//! 1. identity and runtime facts
//! 2. bootstrap files (`AGENTS.md`, `SOUL.md`, ...)
//! 3. memory
//! 4. always-active skills
//! 5. skills summary
//! 6. history
//! 7. session metadata
//!
//! A character budget is spent in that order. A section that does not fit is
//! cut with a `[truncated]` notice and everything after it is dropped.
//! History gives up its oldest turns first.
//!
//! `build` never reads the clock, so the same inputs give the same payload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use tracing::{debug, warn};

use tidebot_core::bus::types::InboundMessage;
use tidebot_core::error::TurnError;
use tidebot_core::types::{ContentPart, MediaAttachment, MediaSource, Message, Session};

use crate::memory::MemoryStore;
use crate::skills::{self, SkillSource, WorkspaceSkills};

pub const DEFAULT_BOOTSTRAP_FILES: &[&str] =
    &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

pub const DEFAULT_CHAR_BUDGET: usize = 48_000;

const DEFAULT_HISTORY_TURNS: usize = 25;

const TRUNCATION_NOTICE: &str = "\n[truncated]";

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// The assembled model input for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPayload {
    /// System prompt, history, then the current user message.
    pub messages: Vec<Message>,
    /// Whether the character budget cut anything.
    pub truncated: bool,
}

impl ContextPayload {
    /// The current user message (always last).
    pub fn user_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Builds model input from the workspace, memory, skills and session.
pub struct ContextBuilder {
    workspace: PathBuf,
    agent_name: String,
    bootstrap_files: Vec<String>,
    history_turns: usize,
    char_budget: usize,
    memory: MemoryStore,
    skills: Arc<dyn SkillSource>,
}

impl ContextBuilder {
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        let workspace = workspace.into();
        Self {
            memory: MemoryStore::new(&workspace),
            skills: Arc::new(WorkspaceSkills::new(&workspace)),
            workspace,
            agent_name: agent_name.into(),
            bootstrap_files: DEFAULT_BOOTSTRAP_FILES.iter().map(|s| s.to_string()).collect(),
            history_turns: DEFAULT_HISTORY_TURNS,
            char_budget: DEFAULT_CHAR_BUDGET,
        }
    }

    pub fn with_bootstrap_files(mut self, files: Vec<String>) -> Self {
        self.bootstrap_files = files;
        self
    }

    pub fn with_history_turns(mut self, turns: usize) -> Self {
        self.history_turns = turns;
        self
    }

    pub fn with_char_budget(mut self, budget: usize) -> Self {
        self.char_budget = budget;
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillSource>) -> Self {
        self.skills = skills;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Assemble the payload for `inbound` on top of `session`.
    ///
    /// # Errors
    /// [`TurnError::Context`] when a bootstrap file exists but cannot be read.
    pub fn build(
        &self,
        session: &Session,
        inbound: &InboundMessage,
    ) -> Result<ContextPayload, TurnError> {
        let mut budget = Budget::new(self.char_budget);
        let mut system_sections = Vec::new();

        let mut leading = vec![self.identity(inbound)];
        leading.extend(self.bootstrap_sections()?);
        leading.extend(self.memory.context_for(inbound.timestamp.date_naive()));

        let skills = self.skills.skills();
        leading.extend(skills::render_active(&skills));
        leading.extend(skills::render_summary(&skills));

        for section in leading {
            if let Some(kept) = budget.take(section) {
                system_sections.push(kept);
            }
        }

        let history = budget.take_history(session.recent_history(self.history_turns));

        if let Some(meta) = budget.take(session_metadata(session, inbound)) {
            system_sections.push(meta);
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system_sections.join(SECTION_SEPARATOR)));
        messages.extend_from_slice(history);
        messages.push(user_message(inbound));

        if budget.exhausted {
            debug!(session = %session.key, budget = self.char_budget, "context budget exhausted");
        }
        Ok(ContextPayload {
            messages,
            truncated: budget.exhausted,
        })
    }

    fn identity(&self, inbound: &InboundMessage) -> String {
        let now = inbound.timestamp.format("%Y-%m-%d %H:%M:%S UTC");
        let today = inbound.timestamp.format("%Y-%m-%d");
        let workspace = self.workspace.display();
        format!(
            "# Identity\n\n\
             You are **{name}**, a personal AI assistant.\n\n\
             - **Date/time**: {now}\n\
             - **Runtime**: Rust on {os}/{arch}\n\
             - **Workspace**: `{workspace}`\n\n\
             Use your tools when they help answer the question; prefer them over guessing. \
             Be concise.\n\n\
             ## Remembering\n\n\
             Persist important facts by writing to `{memory}`. \
             Daily notes go to `{workspace}/memory/{today}.md`.",
            name = self.agent_name,
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            memory = self.memory.memory_file().display(),
        )
    }

    fn bootstrap_sections(&self) -> Result<Vec<String>, TurnError> {
        let mut sections = Vec::new();
        for name in &self.bootstrap_files {
            let path = self.workspace.join(name);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    debug!(file = %name, "loaded bootstrap file");
                    sections.push(format!("## {name}\n\n{}", content.trim_end()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(TurnError::Context(format!(
                        "bootstrap file {} unreadable: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(sections)
    }
}

// ─────────────────────────────────────────────
// Budget
// ─────────────────────────────────────────────

struct Budget {
    remaining: usize,
    exhausted: bool,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: limit,
            exhausted: false,
        }
    }

    /// Admit a text section, cutting it if it does not fit.
    fn take(&mut self, section: String) -> Option<String> {
        if self.exhausted {
            return None;
        }
        let len = section.chars().count();
        if len <= self.remaining {
            self.remaining -= len;
            return Some(section);
        }

        self.exhausted = true;
        let keep = self.remaining.saturating_sub(TRUNCATION_NOTICE.len());
        self.remaining = 0;
        if keep == 0 {
            return None;
        }
        let mut cut: String = section.chars().take(keep).collect();
        cut.push_str(TRUNCATION_NOTICE);
        Some(cut)
    }

    /// Admit as many of the newest whole turns as fit.
    fn take_history<'a>(&mut self, history: &'a [Message]) -> &'a [Message] {
        if self.exhausted {
            return &[];
        }
        let total: usize = history.iter().map(Message::char_len).sum();
        if total <= self.remaining {
            self.remaining -= total;
            return history;
        }

        self.exhausted = true;
        let mut spent = total;
        let mut start = 0;
        while spent > self.remaining && start < history.len() {
            spent -= history[start].char_len();
            start += 1;
            // Resume at the next user message so history never opens mid-turn.
            while start < history.len() && !history[start].is_user() {
                spent -= history[start].char_len();
                start += 1;
            }
        }
        self.remaining -= spent;
        &history[start..]
    }
}

// ─────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────

fn session_metadata(session: &Session, inbound: &InboundMessage) -> String {
    let mut lines = vec![
        "## Current Session".to_string(),
        format!("Channel: {}", inbound.channel),
        format!("Chat ID: {}", inbound.chat_id),
        format!("Session: {}", session.key),
        format!("Turn: {}", session.turns + 1),
    ];
    if let Some(model) = &session.model_override {
        lines.push(format!("Model: {model}"));
    }

    let mut extra: Vec<(&String, &String)> = session
        .metadata
        .iter()
        .chain(inbound.metadata.iter())
        .collect();
    extra.sort();
    lines.extend(extra.into_iter().map(|(k, v)| format!("{k}: {v}")));
    lines.join("\n")
}

/// The current user message, with image attachments placed ahead of the text.
fn user_message(inbound: &InboundMessage) -> Message {
    let mut parts: Vec<ContentPart> = inbound.media.iter().filter_map(encode_media).collect();
    if parts.is_empty() {
        return Message::user(inbound.content.clone());
    }
    parts.push(ContentPart::Text {
        text: inbound.content.clone(),
    });
    Message::user_parts(parts)
}

fn encode_media(media: &MediaAttachment) -> Option<ContentPart> {
    let media_type = media
        .mime_type
        .clone()
        .or_else(|| {
            media
                .filename
                .as_deref()
                .or_else(|| media.path().and_then(|p| p.to_str()))
                .and_then(guess_mime)
                .map(String::from)
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());

    if !media_type.starts_with("image/") {
        debug!(media_type = %media_type, "skipping non-image attachment");
        return None;
    }

    let data = match &media.source {
        MediaSource::Bytes(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
        MediaSource::Path(path) => match std::fs::read(path) {
            Ok(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "media unreadable, skipping");
                return None;
            }
        },
    };
    Some(ContentPart::Media { media_type, data })
}

/// MIME type from a file extension.
fn guess_mime(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => return None,
    };
    Some(mime)
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use tidebot_core::types::MessageContent;

    use crate::skills::{SkillDescriptor, StaticSkills};

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage::new("telegram", "user1", "42", text)
            .with_timestamp(Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap())
    }

    fn system_text(payload: &ContextPayload) -> String {
        payload.messages[0].text()
    }

    fn session_with_turns(turns: usize) -> Session {
        let mut session = Session::new("telegram:42");
        for i in 0..turns {
            session.messages.push(Message::user(format!("question {i}")));
            session.messages.push(Message::assistant(format!("answer {i}")));
        }
        session.turns = turns as u64;
        session
    }

    #[test]
    fn test_section_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "Be kind.").unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Agent rules.").unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory").join("MEMORY.md"), "Likes tea.").unwrap();

        let builder = ContextBuilder::new(dir.path(), "tidebot").with_skills(Arc::new(
            StaticSkills::new(vec![
                SkillDescriptor::new("style", "House style")
                    .always_active()
                    .with_instructions("Short answers."),
                SkillDescriptor::new("weather", "Forecasts"),
            ]),
        ));
        let payload = builder.build(&session_with_turns(1), &inbound("hi")).unwrap();
        let system = system_text(&payload);

        let order = [
            "# Identity",
            "## AGENTS.md",
            "## SOUL.md",
            "# Memory",
            "# Active Skills",
            "<name>weather</name>",
            "## Current Session",
        ];
        let positions: Vec<usize> = order.iter().map(|s| system.find(s).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
        assert!(system.contains("2026-03-14 09:30:00 UTC"));
        assert!(system.contains("Session: telegram:42\nTurn: 2"));

        assert_eq!(payload.messages.len(), 4);
        assert_eq!(payload.messages[1].text(), "question 0");
        assert_eq!(payload.user_message().unwrap().text(), "hi");
        assert!(!payload.truncated);
    }

    #[test]
    fn test_build_is_deterministic() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("USER.md"), "Name: Sam").unwrap();
        let builder = ContextBuilder::new(dir.path(), "tidebot");
        let session = session_with_turns(3);
        let msg = inbound("same input");

        let first = serde_json::to_string(&builder.build(&session, &msg).unwrap().messages).unwrap();
        let second = serde_json::to_string(&builder.build(&session, &msg).unwrap().messages).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_history_bounded_to_turns() {
        let dir = TempDir::new().unwrap();
        let builder = ContextBuilder::new(dir.path(), "tidebot").with_history_turns(2);
        let payload = builder.build(&session_with_turns(5), &inbound("now")).unwrap();
        let texts: Vec<String> = payload.messages[1..].iter().map(Message::text).collect();
        assert_eq!(texts, vec!["question 3", "answer 3", "question 4", "answer 4", "now"]);
    }

    #[test]
    fn test_budget_truncates_and_drops_later_sections() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "x".repeat(5_000)).unwrap();
        std::fs::write(dir.path().join("TOOLS.md"), "never reached").unwrap();
        let builder = ContextBuilder::new(dir.path(), "tidebot").with_char_budget(2_000);

        let payload = builder.build(&session_with_turns(2), &inbound("hi")).unwrap();
        let system = system_text(&payload);
        assert!(payload.truncated);
        assert!(system.contains("# Identity"));
        assert!(system.ends_with("[truncated]"));
        assert!(!system.contains("never reached"));
        assert!(!system.contains("## Current Session"));
        // History is dropped once the budget is spent; the user message survives.
        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.user_message().unwrap().text(), "hi");
    }

    #[test]
    fn test_history_trimmed_oldest_first() {
        let dir = TempDir::new().unwrap();
        let builder = ContextBuilder::new(dir.path(), "tidebot").with_skills(Arc::new(StaticSkills::default()));
        let identity_len = builder.identity(&inbound("hi")).chars().count();
        let mut session = Session::new("telegram:42");
        for i in 0..4 {
            session.messages.push(Message::user(format!("q{i} {}", "y".repeat(100))));
            session.messages.push(Message::assistant(format!("a{i}")));
        }

        let builder = builder.with_char_budget(identity_len + 250);
        let payload = builder.build(&session, &inbound("hi")).unwrap();
        assert!(payload.truncated);
        assert!(payload.messages[1].is_user());
        assert!(payload.messages[1].text().starts_with("q2"));
        assert_eq!(payload.messages.len(), 1 + 4 + 1);
    }

    #[test]
    fn test_unreadable_bootstrap_is_context_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), [0xff, 0xfe, 0xfd]).unwrap();
        let builder = ContextBuilder::new(dir.path(), "tidebot");
        let err = builder.build(&Session::new("k"), &inbound("hi")).unwrap_err();
        assert!(matches!(err, TurnError::Context(_)));
    }

    #[test]
    fn test_media_goes_before_text() {
        let dir = TempDir::new().unwrap();
        let photo = dir.path().join("photo.png");
        std::fs::write(&photo, [1u8, 2, 3]).unwrap();

        let msg = inbound("what is this?")
            .with_media(MediaAttachment::from_path(&photo))
            .with_media(MediaAttachment::from_path(dir.path().join("missing.jpg")))
            .with_media(MediaAttachment::from_path(dir.path().join("voice.ogg")))
            .with_media(MediaAttachment::from_bytes(vec![9u8], "image/gif"));

        let builder = ContextBuilder::new(dir.path(), "tidebot");
        let payload = builder.build(&Session::new("k"), &msg).unwrap();
        let Some(Message::User {
            content: MessageContent::Parts(parts),
        }) = payload.user_message()
        else {
            panic!("expected multi-part user message");
        };
        assert_eq!(
            parts,
            &vec![
                ContentPart::Media {
                    media_type: "image/png".into(),
                    data: "AQID".into()
                },
                ContentPart::Media {
                    media_type: "image/gif".into(),
                    data: "CQ==".into()
                },
                ContentPart::Text {
                    text: "what is this?".into()
                },
            ]
        );
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("a/b/PHOTO.JPG"), Some("image/jpeg"));
        assert_eq!(guess_mime("voice.ogg"), Some("audio/ogg"));
        assert_eq!(guess_mime("noext"), None);
    }
}
