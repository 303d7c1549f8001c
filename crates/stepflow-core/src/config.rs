use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};
use crate::types::{RetryPolicy, WorkflowDefinition};

/// Top-level Stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Workflow runner tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Randomize retry backoff by 0.8x to 1.2x (default: false).
    #[serde(default)]
    pub jitter: bool,
    /// Timeout for human gates that do not configure their own.
    #[serde(default)]
    pub default_gate_timeout_ms: Option<u64>,
    /// Ceiling for a single retry backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            jitter: false,
            default_gate_timeout_ms: None,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_backoff_ms() -> u64 { 300_000 }

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.stepflow/runs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.stepflow/runs".to_string() }

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

/// Defaults applied to nodes that leave a setting unspecified.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Fill in per-node settings the definition leaves unspecified.
    pub fn apply_defaults(&self, def: &mut WorkflowDefinition) {
        if let Some(retry) = self.defaults.retry {
            for node in def.nodes.iter_mut().filter(|n| n.retry.is_none()) {
                node.retry = Some(retry);
            }
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeDefinition, NodeType};

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(!config.runner.jitter);
        assert_eq!(config.runner.max_backoff_ms, 300_000);
        assert_eq!(config.events.capacity, 256);
        assert!(config.log.is_none());
        assert!(config.defaults.retry.is_none());
    }

    #[test]
    fn test_log_section_defaults() {
        let config: EngineConfig = toml::from_str("[log]\n").unwrap();
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.log_dir, "~/.stepflow/runs");
    }

    #[test]
    fn test_apply_default_retry_only_where_missing() {
        let config: EngineConfig = toml::from_str(
            r#"
[defaults.retry]
max_attempts = 4
base_delay_ms = 50
"#,
        )
        .unwrap();

        let mut def = WorkflowDefinition::new("wf", 1)
            .with_node(NodeDefinition::new("a", NodeType::ToolCall))
            .with_node(
                NodeDefinition::new("b", NodeType::ToolCall).with_retry(RetryPolicy::new(1, 0, 1.0)),
            );
        config.apply_defaults(&mut def);

        let a = def.node("a").unwrap().retry_policy();
        assert_eq!(a.max_attempts, 4);
        assert_eq!(a.base_delay_ms, 50);
        assert_eq!(a.multiplier, 2.0);
        assert_eq!(def.node("b").unwrap().retry_policy().max_attempts, 1);
    }

    #[test]
    fn test_missing_file_is_config_not_found() {
        let err = EngineConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, StepflowError::ConfigNotFound(_)));
    }
}
