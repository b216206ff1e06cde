//! Skills: Markdown instructions that teach the agent to combine its tools.
//!
//! Skills never register tools. A skill is either **always active** (its
//! full instructions go into every prompt) or **on demand** (only a summary
//! goes in, and the model reads the file with `read_file` when it needs it).
//!
//! ## SKILL.md format
//!
//! ```text
//! ---
//! name: github
//! description: "Interact with GitHub using the gh CLI"
//! always: false
//! requires: {"bins": ["gh"], "env": ["GH_TOKEN"]}
//! ---
//!
//! # GitHub Skill
//!
//! Use the `exec` tool to run `gh` commands ...
//! ```
//!
//! Front matter is parsed line by line; `requires` (or a `metadata` object
//! holding `requires`/`always`) is inline JSON.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

// ─────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────

/// Prerequisites a skill needs before it is usable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SkillRequires {
    /// Executables that must be on `PATH`.
    #[serde(default)]
    pub bins: Vec<String>,
    /// Environment variables that must be set.
    #[serde(default)]
    pub env: Vec<String>,
}

impl SkillRequires {
    /// Human-readable unmet prerequisites, e.g. `["CLI: gh", "ENV: GH_TOKEN"]`.
    pub fn missing(&self) -> Vec<String> {
        let bins = self
            .bins
            .iter()
            .filter(|b| !is_binary_available(b))
            .map(|b| format!("CLI: {b}"));
        let env = self
            .env
            .iter()
            .filter(|v| std::env::var_os(v).is_none())
            .map(|v| format!("ENV: {v}"));
        bins.chain(env).collect()
    }

    pub fn is_met(&self) -> bool {
        self.missing().is_empty()
    }
}

/// Everything the context builder needs to know about one skill.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    pub always: bool,
    pub requires: SkillRequires,
    /// Body of the skill file with front matter removed.
    pub instructions: String,
    /// Where the model can read the full file, if it lives on disk.
    pub location: Option<PathBuf>,
}

impl SkillDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            always: false,
            requires: SkillRequires::default(),
            instructions: String::new(),
            location: None,
        }
    }

    pub fn always_active(mut self) -> Self {
        self.always = true;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_requires(mut self, requires: SkillRequires) -> Self {
        self.requires = requires;
        self
    }

    /// Parse a `SKILL.md` file. `fallback_name` is used when the front
    /// matter has no `name`.
    pub fn parse(fallback_name: &str, content: &str) -> Self {
        let (front, body) = split_front_matter(content);
        let mut skill = SkillDescriptor::new(fallback_name, fallback_name);
        skill.instructions = body.trim().to_string();

        for (key, value) in front {
            match key {
                "name" if !value.is_empty() => skill.name = unquote(value).to_string(),
                "description" => skill.description = unquote(value).to_string(),
                "always" => skill.always = value == "true",
                "requires" => skill.requires = parse_requires(value),
                "metadata" => apply_metadata(&mut skill, value),
                _ => {}
            }
        }
        skill
    }
}

/// Anything that can list skills. Implementations return them sorted by name.
pub trait SkillSource: Send + Sync {
    fn skills(&self) -> Vec<SkillDescriptor>;
}

// ─────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────

/// Skills found at `{workspace}/skills/<name>/SKILL.md`.
#[derive(Debug, Clone)]
pub struct WorkspaceSkills {
    dir: PathBuf,
}

impl WorkspaceSkills {
    pub fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join("skills"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SkillSource for WorkspaceSkills {
    fn skills(&self) -> Vec<SkillDescriptor> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "skills directory unreadable");
                return Vec::new();
            }
        };

        let mut skills: Vec<SkillDescriptor> = entries
            .flatten()
            .filter_map(|entry| {
                let file = entry.path().join("SKILL.md");
                let dir_name = entry.file_name().to_string_lossy().into_owned();
                let content = std::fs::read_to_string(&file).ok()?;
                debug!(name = %dir_name, "discovered skill");
                let mut skill = SkillDescriptor::parse(&dir_name, &content);
                skill.location = Some(file);
                Some(skill)
            })
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }
}

/// A fixed list of skills, for hosts that ship skills in code.
#[derive(Debug, Clone, Default)]
pub struct StaticSkills(Vec<SkillDescriptor>);

impl StaticSkills {
    pub fn new(mut skills: Vec<SkillDescriptor>) -> Self {
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Self(skills)
    }
}

impl SkillSource for StaticSkills {
    fn skills(&self) -> Vec<SkillDescriptor> {
        self.0.clone()
    }
}

// ─────────────────────────────────────────────
// Prompt rendering
// ─────────────────────────────────────────────

/// Full instructions of always-active skills whose prerequisites are met.
pub fn render_active(skills: &[SkillDescriptor]) -> Option<String> {
    let parts: Vec<String> = skills
        .iter()
        .filter(|s| s.always && s.requires.is_met() && !s.instructions.is_empty())
        .map(|s| format!("### Skill: {}\n\n{}", s.name, s.instructions))
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(format!("# Active Skills\n\n{}", parts.join("\n\n---\n\n")))
}

/// XML summary of the on-demand skills.
pub fn render_summary(skills: &[SkillDescriptor]) -> Option<String> {
    let on_demand: Vec<&SkillDescriptor> = skills
        .iter()
        .filter(|s| !(s.always && s.requires.is_met()))
        .collect();
    if on_demand.is_empty() {
        return None;
    }

    let mut lines = vec![
        "# Skills".to_string(),
        String::new(),
        "Read a skill's file with read_file before using it.".to_string(),
        "<skills>".to_string(),
    ];
    for skill in on_demand {
        let missing = skill.requires.missing();
        lines.push(format!("  <skill available=\"{}\">", missing.is_empty()));
        lines.push(format!("    <name>{}</name>", escape_xml(&skill.name)));
        lines.push(format!(
            "    <description>{}</description>",
            escape_xml(&skill.description)
        ));
        if let Some(location) = &skill.location {
            lines.push(format!(
                "    <location>{}</location>",
                escape_xml(&location.display().to_string())
            ));
        }
        if !missing.is_empty() {
            lines.push(format!("    <requires>{}</requires>", escape_xml(&missing.join(", "))));
        }
        lines.push("  </skill>".to_string());
    }
    lines.push("</skills>".to_string());
    Some(lines.join("\n"))
}

// ─────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────

/// Split `---`-delimited front matter into key/value pairs and the body.
fn split_front_matter(content: &str) -> (Vec<(&str, &str)>, &str) {
    let Some(after_open) = content.strip_prefix("---") else {
        return (Vec::new(), content);
    };
    let Some(end) = after_open.find("\n---") else {
        return (Vec::new(), content);
    };
    let block = &after_open[..end];
    let body = after_open[end + 4..].trim_start_matches(['\r', '\n']);

    let pairs = block
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key, value.trim()))
        })
        .collect();
    (pairs, body)
}

fn unquote(value: &str) -> &str {
    value.trim_matches('"').trim_matches('\'')
}

fn parse_requires(raw: &str) -> SkillRequires {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "skill requires is not valid JSON, ignoring");
        SkillRequires::default()
    })
}

/// `metadata: {"requires": {...}, "always": true}`, optionally nested one
/// level under a namespace key.
fn apply_metadata(skill: &mut SkillDescriptor, raw: &str) {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        warn!(skill = %skill.name, "skill metadata is not valid JSON, ignoring");
        return;
    };
    let scope = if value.get("requires").is_some() || value.get("always").is_some() {
        Some(&value)
    } else {
        value.as_object().and_then(|o| o.values().find(|v| v.is_object()))
    };
    let Some(scope) = scope else {
        return;
    };
    if let Some(always) = scope.get("always").and_then(Value::as_bool) {
        skill.always |= always;
    }
    if let Some(requires) = scope.get("requires") {
        if let Ok(requires) = serde_json::from_value(requires.clone()) {
            skill.requires = requires;
        }
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn is_binary_available(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_skill(base: &Path, name: &str, content: &str) {
        let dir = base.join("skills").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), content).unwrap();
    }

    #[test]
    fn test_parse_front_matter() {
        let skill = SkillDescriptor::parse(
            "dir-name",
            "---\nname: github\ndescription: \"GitHub CLI\"\nalways: true\nrequires: {\"bins\": [\"gh\"]}\n---\n\n# GitHub\nUse gh.",
        );
        assert_eq!(skill.name, "github");
        assert_eq!(skill.description, "GitHub CLI");
        assert!(skill.always);
        assert_eq!(skill.requires.bins, vec!["gh"]);
        assert_eq!(skill.instructions, "# GitHub\nUse gh.");
    }

    #[test]
    fn test_parse_without_front_matter() {
        let skill = SkillDescriptor::parse("notes", "# Notes\nbody");
        assert_eq!(skill.name, "notes");
        assert_eq!(skill.description, "notes");
        assert!(!skill.always);
        assert_eq!(skill.instructions, "# Notes\nbody");
    }

    #[test]
    fn test_namespaced_metadata() {
        let skill = SkillDescriptor::parse(
            "tmux",
            "---\nmetadata: {\"bot\":{\"always\":true,\"requires\":{\"env\":[\"TIDEBOT_TEST_UNSET_VAR\"]}}}\n---\nbody",
        );
        assert!(skill.always);
        assert_eq!(skill.requires.env, vec!["TIDEBOT_TEST_UNSET_VAR"]);
        assert_eq!(skill.requires.missing(), vec!["ENV: TIDEBOT_TEST_UNSET_VAR"]);
    }

    #[test]
    fn test_workspace_skills_sorted() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "zeta", "---\ndescription: last\n---\nz");
        write_skill(dir.path(), "alpha", "---\ndescription: first\n---\na");
        std::fs::create_dir_all(dir.path().join("skills").join("empty")).unwrap();

        let skills = WorkspaceSkills::new(dir.path()).skills();
        let names: Vec<&str> = skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(skills[0].location.as_ref().unwrap().ends_with("alpha/SKILL.md"));
    }

    #[test]
    fn test_missing_skills_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(WorkspaceSkills::new(dir.path()).skills().is_empty());
    }

    #[test]
    fn test_render_active_and_summary() {
        let skills = StaticSkills::new(vec![
            SkillDescriptor::new("weather", "Forecasts").with_instructions("Use curl wttr.in"),
            SkillDescriptor::new("style", "House style")
                .always_active()
                .with_instructions("Be brief."),
            SkillDescriptor::new("blocked", "Needs env")
                .always_active()
                .with_instructions("never shown")
                .with_requires(SkillRequires {
                    bins: vec![],
                    env: vec!["TIDEBOT_TEST_UNSET_VAR".into()],
                }),
        ])
        .skills();

        let active = render_active(&skills).unwrap();
        assert!(active.contains("### Skill: style\n\nBe brief."));
        assert!(!active.contains("never shown"));

        let summary = render_summary(&skills).unwrap();
        assert!(summary.contains("<name>weather</name>"));
        assert!(summary.contains("<skill available=\"false\">"));
        assert!(summary.contains("<requires>ENV: TIDEBOT_TEST_UNSET_VAR</requires>"));
        assert!(!summary.contains("<name>style</name>"));
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
