//! Workspace boundary for filesystem and shell tools.
//!
//! Every path a tool touches goes through [`Sandbox::resolve`]: `~` is
//! expanded, relative paths are joined to the workspace, `..` is folded
//! lexically and the deepest existing ancestor is canonicalized, so symlinks
//! pointing outside are caught. When restriction is on, anything that lands
//! outside the canonical workspace root is a [`SandboxViolation`].
//!
//! Protected paths (the audit trail, the secrets file) are refused whether or
//! not restriction is on.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use tidebot_core::error::SandboxViolation;
use tidebot_core::utils;

/// Paths shell commands may always mention.
const HARMLESS_PATHS: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr"];

/// Workspace root plus the restriction flag. Owned by a tool registry.
#[derive(Clone, Debug)]
pub struct Sandbox {
    root: PathBuf,
    restricted: bool,
    protected: Vec<PathBuf>,
}

impl Sandbox {
    pub fn new(workspace: impl AsRef<Path>, restricted: bool) -> Self {
        let workspace = workspace.as_ref();
        let root = workspace
            .canonicalize()
            .unwrap_or_else(|_| fold_lexically(workspace));
        Sandbox {
            root,
            restricted,
            protected: Vec::new(),
        }
    }

    /// Refuse `path` and everything below it.
    pub fn with_protected(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        self.protected.push(canonicalize_existing(&fold_lexically(&joined)));
        self
    }

    /// A sandbox that resolves paths against `workspace` but allows any target.
    pub fn unrestricted(workspace: impl AsRef<Path>) -> Self {
        Self::new(workspace, false)
    }

    pub fn restricted(workspace: impl AsRef<Path>) -> Self {
        Self::new(workspace, true)
    }

    pub fn workspace(&self) -> &Path {
        &self.root
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    /// Resolve a model-supplied path. Fails only when restricted and outside.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, SandboxViolation> {
        let expanded = utils::expand_home(raw.trim());
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.root.join(expanded)
        };
        let resolved = canonicalize_existing(&fold_lexically(&joined));

        if self.protected.iter().any(|p| resolved.starts_with(p)) {
            return Err(SandboxViolation {
                target: raw.to_string(),
                reason: "is reserved for tidebot's own state".to_string(),
            });
        }
        if self.restricted && !resolved.starts_with(&self.root) {
            return Err(SandboxViolation {
                target: raw.to_string(),
                reason: format!("resolves outside the workspace {}", self.root.display()),
            });
        }
        Ok(resolved)
    }

    /// Check the working directory and path-like tokens of a shell command.
    ///
    /// Returns the resolved working directory.
    pub fn check_command(
        &self,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<PathBuf, SandboxViolation> {
        let cwd = match working_dir {
            Some(dir) => self.resolve(dir)?,
            None => self.root.clone(),
        };
        if let Some(reserved) = self.mentioned_protected(command) {
            return Err(SandboxViolation {
                target: command.to_string(),
                reason: format!("touches {reserved}, which is reserved for tidebot's own state"),
            });
        }
        if !self.restricted {
            return Ok(cwd);
        }

        if has_parent_traversal(command) {
            return Err(SandboxViolation {
                target: command.to_string(),
                reason: "uses path traversal (..)".to_string(),
            });
        }

        for token in path_tokens(command) {
            if HARMLESS_PATHS.contains(&token) {
                continue;
            }
            self.resolve(token)?;
        }
        Ok(cwd)
    }

    /// First protected path a command names, absolute or workspace-relative.
    fn mentioned_protected(&self, command: &str) -> Option<String> {
        self.protected.iter().find_map(|p| {
            let absolute = p.display().to_string();
            let relative = p
                .strip_prefix(&self.root)
                .ok()
                .map(|r| r.display().to_string())
                .filter(|r| !r.is_empty());
            std::iter::once(absolute)
                .chain(relative)
                .find(|needle| command.contains(needle.as_str()))
        })
    }
}

/// Remove `.` and fold `..` without touching the filesystem.
fn fold_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root.
                if !out.pop() && !out.has_root() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Canonicalize the deepest ancestor that exists and re-append the rest.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(canon) = existing.canonicalize() {
            return tail.iter().rev().fold(canon, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn has_parent_traversal(command: &str) -> bool {
    command.contains("../")
        || command.contains("..\\")
        || command
            .split_whitespace()
            .any(|tok| tok.trim_matches(|c| c == '"' || c == '\'') == "..")
}

/// Absolute or home-relative paths appearing in a command.
fn path_tokens(command: &str) -> impl Iterator<Item = &str> {
    static PATH_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATH_RE
        .get_or_init(|| Regex::new(r#"(?:^|[\s=<>|;&(])['"]?((?:/|~/)[^\s'";|&<>()]*)"#).ok())
        .as_ref();
    re.into_iter()
        .flat_map(move |re| re.captures_iter(command))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}
