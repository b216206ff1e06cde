//! Config loader: reads `~/.tidebot/config.json`, applies legacy migrations,
//! then environment overrides.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.tidebot/config.json`
//! 3. Environment variables `TIDEBOT_<SECTION>__<FIELD>` (override JSON)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::schema::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from `path` (or the default path) plus env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be parsed.
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    if !config_path.exists() {
        info!("No config file found at {}, using defaults", config_path.display());
        return apply_env_overrides(Config::default());
    }

    match read_config(&config_path) {
        Ok(config) => apply_env_overrides(config),
        Err(e) => {
            warn!(error = %e, "Falling back to default configuration");
            apply_env_overrides(Config::default())
        }
    }
}

/// Read and migrate a config file, without env overrides or fallbacks.
pub fn read_config(path: &Path) -> Result<Config, ConfigError> {
    debug!("Loading config from {}", path.display());

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let mut raw: serde_json::Value = serde_json::from_str(&content).map_err(parse_err)?;
    migrate_config(&mut raw);
    serde_json::from_value(raw).map_err(parse_err)
}

/// Save configuration to disk (pretty-printed JSON with camelCase keys).
pub fn save_config(config: &Config, path: Option<&Path>) -> Result<(), ConfigError> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);
    let write_err = |source| ConfigError::Write {
        path: config_path.clone(),
        source,
    };

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: config_path.clone(),
        source,
    })?;
    std::fs::write(&config_path, json).map_err(write_err)?;
    debug!("Config saved to {}", config_path.display());
    Ok(())
}

/// Moves `tools.exec.restrictToWorkspace` → `tools.restrictToWorkspace`.
fn migrate_config(raw: &mut serde_json::Value) {
    let Some(tools) = raw.get_mut("tools") else {
        return;
    };
    let legacy = tools
        .get("exec")
        .and_then(|exec| exec.get("restrictToWorkspace"))
        .cloned();
    if let Some(restrict) = legacy {
        if tools.get("restrictToWorkspace").is_none() {
            tools["restrictToWorkspace"] = restrict;
            debug!("Migrated tools.exec.restrictToWorkspace → tools.restrictToWorkspace");
        }
    }
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `TIDEBOT_<SECTION>__<FIELD>` (double underscore as delimiter).
///
/// Supported overrides:
/// - `TIDEBOT_AGENTS__DEFAULTS__MODEL` → `agents.defaults.model`
/// - `TIDEBOT_AGENTS__DEFAULTS__WORKSPACE` → `agents.defaults.workspace`
/// - `TIDEBOT_AGENTS__DEFAULTS__MAX_TOKENS`, `__TEMPERATURE`, `__MAX_TOOL_ITERATIONS`, `__HISTORY_TURNS`
/// - `TIDEBOT_PROVIDER__API_KEY` / `TIDEBOT_PROVIDER__API_BASE`
/// - `TIDEBOT_TOOLS__RESTRICT_TO_WORKSPACE`
fn apply_env_overrides(mut config: Config) -> Config {
    let d = &mut config.agents.defaults;
    if let Ok(val) = std::env::var("TIDEBOT_AGENTS__DEFAULTS__MODEL") {
        d.model = val;
    }
    if let Ok(val) = std::env::var("TIDEBOT_AGENTS__DEFAULTS__WORKSPACE") {
        d.workspace = val;
    }
    env_parse("TIDEBOT_AGENTS__DEFAULTS__MAX_TOKENS", &mut d.max_tokens);
    env_parse("TIDEBOT_AGENTS__DEFAULTS__TEMPERATURE", &mut d.temperature);
    env_parse("TIDEBOT_AGENTS__DEFAULTS__MAX_TOOL_ITERATIONS", &mut d.max_tool_iterations);
    env_parse("TIDEBOT_AGENTS__DEFAULTS__HISTORY_TURNS", &mut d.history_turns);

    if let Ok(val) = std::env::var("TIDEBOT_PROVIDER__API_KEY") {
        config.provider.api_key = val;
    }
    if let Ok(val) = std::env::var("TIDEBOT_PROVIDER__API_BASE") {
        config.provider.api_base = Some(val);
    }

    if let Ok(val) = std::env::var("TIDEBOT_TOOLS__RESTRICT_TO_WORKSPACE") {
        config.tools.restrict_to_workspace = val == "true" || val == "1";
    }

    config
}

fn env_parse<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(var, value = %val, "Ignoring unparsable env override"),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp_json(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/path/config.json")));
        assert_eq!(config.agents.defaults.max_tokens, 8192);
    }

    #[test]
    fn test_load_valid_json() {
        let file = write_temp_json(
            r#"{
            "agents": {
                "defaults": {
                    "model": "gpt-4o",
                    "maxTokens": 2048
                }
            }
        }"#,
        );

        let config = read_config(file.path()).unwrap();
        assert_eq!(config.agents.defaults.model, "gpt-4o");
        assert_eq!(config.agents.defaults.max_tokens, 2048);
        assert_eq!(config.agents.defaults.temperature, 0.7);
    }

    #[test]
    fn test_load_invalid_json_returns_defaults() {
        let file = write_temp_json("not valid json {{{");
        let config = load_config(Some(file.path()));
        assert_eq!(config.agents.defaults.max_tokens, 8192);
    }

    #[test]
    fn test_read_config_reports_parse_error() {
        let file = write_temp_json("{\"agents\": 12}");
        assert!(matches!(read_config(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.agents.defaults.model = "deepseek-chat".to_string();
        config.provider.api_key = "sk-test".to_string();

        save_config(&config, Some(&path)).unwrap();

        let reloaded = read_config(&path).unwrap();
        assert_eq!(reloaded.agents.defaults.model, "deepseek-chat");
        assert_eq!(reloaded.provider.api_key, "sk-test");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["agents"]["defaults"].get("maxTokens").is_some());
    }

    #[test]
    fn test_migrate_restrict_to_workspace() {
        let file = write_temp_json(
            r#"{
            "tools": {
                "exec": {
                    "restrictToWorkspace": true,
                    "timeout": 30
                }
            }
        }"#,
        );

        let config = read_config(file.path()).unwrap();
        assert!(config.tools.restrict_to_workspace);
        assert_eq!(config.tools.exec.timeout, 30);
    }

    #[test]
    fn test_migrate_no_overwrite() {
        let file = write_temp_json(
            r#"{
            "tools": {
                "restrictToWorkspace": false,
                "exec": { "restrictToWorkspace": true }
            }
        }"#,
        );

        let config = read_config(file.path()).unwrap();
        assert!(!config.tools.restrict_to_workspace);
    }

    #[test]
    fn test_env_override_model() {
        std::env::set_var("TIDEBOT_AGENTS__DEFAULTS__MODEL", "test-model");
        let config = apply_env_overrides(Config::default());
        assert_eq!(config.agents.defaults.model, "test-model");
        std::env::remove_var("TIDEBOT_AGENTS__DEFAULTS__MODEL");
    }

    #[test]
    fn test_env_override_provider_key() {
        std::env::set_var("TIDEBOT_PROVIDER__API_KEY", "sk-env-key");
        let config = apply_env_overrides(Config::default());
        assert_eq!(config.provider.api_key, "sk-env-key");
        std::env::remove_var("TIDEBOT_PROVIDER__API_KEY");
    }

    #[test]
    fn test_env_override_history_turns_ignores_garbage() {
        std::env::set_var("TIDEBOT_AGENTS__DEFAULTS__HISTORY_TURNS", "lots");
        let config = apply_env_overrides(Config::default());
        assert_eq!(config.agents.defaults.history_turns, 25);
        std::env::remove_var("TIDEBOT_AGENTS__DEFAULTS__HISTORY_TURNS");
    }
}
