use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::delegation::agent_config_keys;
use crate::error::{BackgroundError, Result};

pub const DEFAULT_FALLBACK_TIMEOUT_MS: u64 = 15_000;

pub const ENV_MAX_CONCURRENT_STARTS: &str = "MIYA_MAX_CONCURRENT_STARTS";
pub const ENV_FALLBACK_TIMEOUT_MS: &str = "MIYA_FALLBACK_TIMEOUT_MS";
pub const ENV_FALLBACK_ENABLED: &str = "MIYA_FALLBACK_ENABLED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub agents: HashMap<String, AgentOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundConfig {
    /// Cap on tasks concurrently in their start sequence. `None` is unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_starts: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fallback_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub chains: HashMap<String, Vec<String>>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_FALLBACK_TIMEOUT_MS,
            chains: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_fallback_timeout_ms() -> u64 {
    DEFAULT_FALLBACK_TIMEOUT_MS
}

impl PluginConfig {
    pub fn validate(&self) -> Result<()> {
        if self.background.max_concurrent_starts == Some(0) {
            return Err(BackgroundError::InvalidConfig(
                "background.maxConcurrentStarts must be at least 1".to_string(),
            ));
        }
        if self.fallback.timeout_ms == 0 {
            return Err(BackgroundError::InvalidConfig(
                "fallback.timeoutMs must be greater than 0".to_string(),
            ));
        }
        for (agent, chain) in &self.fallback.chains {
            if chain.is_empty() {
                return Err(BackgroundError::InvalidConfig(format!(
                    "fallback.chains.{agent} must list at least one model"
                )));
            }
            if chain.iter().any(|entry| entry.trim().is_empty()) {
                return Err(BackgroundError::InvalidConfig(format!(
                    "fallback.chains.{agent} contains an empty model reference"
                )));
            }
        }
        Ok(())
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback.timeout_ms)
    }

    pub fn agent_override(&self, agent: &str) -> Option<&AgentOverride> {
        agent_config_keys(agent)
            .into_iter()
            .find_map(|key| self.agents.get(key))
    }

    pub fn agent_variant(&self, agent: &str) -> Option<&str> {
        self.agent_override(agent)
            .and_then(|entry| entry.variant.as_deref())
            .filter(|variant| !variant.trim().is_empty())
    }

    /// Ordered, de-duplicated model references to try for `agent`: the
    /// agent's configured model first, then its fallback chain. Empty when
    /// fallback is off or nothing is configured, meaning a single attempt on
    /// the platform default.
    pub fn fallback_chain(&self, agent: &str) -> Vec<String> {
        if !self.fallback.enabled {
            return Vec::new();
        }
        let primary = self
            .agent_override(agent)
            .and_then(|entry| entry.model.as_deref());
        let chain = agent_config_keys(agent)
            .into_iter()
            .find_map(|key| self.fallback.chains.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut resolved: Vec<String> = Vec::new();
        for candidate in primary.into_iter().chain(chain.iter().map(String::as_str)) {
            let candidate = candidate.trim();
            if candidate.is_empty() || resolved.iter().any(|seen| seen == candidate) {
                continue;
            }
            resolved.push(candidate.to_string());
        }
        resolved
    }
}

/// Layered loader: global file, project file, environment, then runtime
/// overrides. Later layers win key by key.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    global_path: Option<PathBuf>,
    project_path: Option<PathBuf>,
    runtime: Value,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            global_path: default_global_config_path(),
            project_path: None,
            runtime: empty_object(),
        }
    }

    pub fn with_global_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_path = Some(path.into());
        self
    }

    pub fn without_global(mut self) -> Self {
        self.global_path = None;
        self
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_path = Some(dir.as_ref().join(".miya").join("miya.json"));
        self
    }

    pub fn with_runtime_overrides(mut self, overrides: Value) -> Self {
        deep_merge(&mut self.runtime, &overrides);
        self
    }

    pub async fn load(&self) -> Result<PluginConfig> {
        self.load_with_env(|key| std::env::var(key).ok()).await
    }

    pub async fn load_with_env<F>(&self, env: F) -> Result<PluginConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = empty_object();
        if let Some(path) = &self.global_path {
            deep_merge(&mut merged, &read_json_file(path).await?);
        }
        if let Some(path) = &self.project_path {
            deep_merge(&mut merged, &read_json_file(path).await?);
        }
        deep_merge(&mut merged, &env_layer(env));
        deep_merge(&mut merged, &self.runtime);

        let config: PluginConfig = serde_json::from_value(merged)
            .map_err(|err| BackgroundError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        tracing::debug!(
            max_concurrent_starts = ?config.background.max_concurrent_starts,
            fallback_enabled = config.fallback.enabled,
            fallback_timeout_ms = config.fallback.timeout_ms,
            "loaded miya config"
        );
        Ok(config)
    }
}

fn default_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MIYA_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("miya").join("miya.json"))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(empty_object()),
        Err(err) => return Err(err.into()),
    };
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str::<Value>(&raw).map_err(|err| {
        BackgroundError::InvalidConfig(format!("failed to parse {}: {err}", path.display()))
    })
}

fn env_layer<F>(env: F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    let mut root = empty_object();

    if let Some(raw) = env(ENV_MAX_CONCURRENT_STARTS) {
        if let Ok(limit) = raw.trim().parse::<usize>() {
            deep_merge(
                &mut root,
                &json!({ "background": { "maxConcurrentStarts": limit } }),
            );
        }
    }
    if let Some(raw) = env(ENV_FALLBACK_TIMEOUT_MS) {
        if let Ok(timeout_ms) = raw.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({ "fallback": { "timeoutMs": timeout_ms } }));
        }
    }
    if let Some(raw) = env(ENV_FALLBACK_ENABLED) {
        if let Some(enabled) = parse_bool_like(&raw) {
            deep_merge(&mut root, &json!({ "fallback": { "enabled": enabled } }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_enable_fallback_with_fifteen_second_budget() {
        let config: PluginConfig = serde_json::from_value(json!({})).expect("config");
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback_timeout(), Duration::from_secs(15));
        assert_eq!(config.background.max_concurrent_starts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = PluginConfig::default();
        config.background.max_concurrent_starts = Some(0);
        assert!(matches!(
            config.validate(),
            Err(BackgroundError::InvalidConfig(_))
        ));

        let mut config = PluginConfig::default();
        config.fallback.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn chain_starts_with_agent_model_and_dedupes() {
        let config: PluginConfig = serde_json::from_value(json!({
            "agents": { "5-code-fixer": { "model": "openai/gpt-5.2-codex" } },
            "fallback": {
                "chains": {
                    "5-code-fixer": ["openai/gpt-5.2-codex", "anthropic/claude-sonnet", "openai/gpt-5.2-codex"]
                }
            }
        }))
        .expect("config");
        assert_eq!(
            config.fallback_chain("5-code-fixer"),
            vec!["openai/gpt-5.2-codex", "anthropic/claude-sonnet"]
        );
    }

    #[test]
    fn chain_falls_back_to_legacy_alias_keys() {
        let config: PluginConfig = serde_json::from_value(json!({
            "fallback": { "chains": { "fixer": ["a/b", "c/d"] } }
        }))
        .expect("config");
        assert_eq!(config.fallback_chain("5-code-fixer"), vec!["a/b", "c/d"]);
        assert!(config.fallback_chain("2-code-search").is_empty());
    }

    #[test]
    fn disabled_fallback_yields_empty_chain() {
        let config: PluginConfig = serde_json::from_value(json!({
            "agents": { "2-code-search": { "model": "a/b", "variant": "high" } },
            "fallback": { "enabled": false, "chains": { "2-code-search": ["c/d"] } }
        }))
        .expect("config");
        assert!(config.fallback_chain("2-code-search").is_empty());
        assert_eq!(config.agent_variant("explorer"), Some("high"));
    }

    #[test]
    fn env_layer_parses_known_variables() {
        let layer = env_layer(|key| match key {
            ENV_MAX_CONCURRENT_STARTS => Some("2".to_string()),
            ENV_FALLBACK_ENABLED => Some("off".to_string()),
            ENV_FALLBACK_TIMEOUT_MS => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(
            layer,
            json!({ "background": { "maxConcurrentStarts": 2 }, "fallback": { "enabled": false } })
        );
    }

    #[tokio::test]
    async fn loader_merges_layers_in_order() {
        let global_dir = tempfile::tempdir().expect("tempdir");
        let project_dir = tempfile::tempdir().expect("tempdir");
        let global_path = global_dir.path().join("miya.json");
        std::fs::write(
            &global_path,
            r#"{"fallback":{"timeoutMs":5000,"chains":{"2-code-search":["a/b"]}},"background":{"maxConcurrentStarts":4}}"#,
        )
        .expect("write global");
        std::fs::create_dir_all(project_dir.path().join(".miya")).expect("mkdir");
        std::fs::write(
            project_dir.path().join(".miya").join("miya.json"),
            r#"{"fallback":{"timeoutMs":8000}}"#,
        )
        .expect("write project");

        let config = ConfigLoader::new()
            .with_global_path(&global_path)
            .with_project_dir(project_dir.path())
            .with_runtime_overrides(json!({ "background": { "maxConcurrentStarts": 1 } }))
            .load_with_env(|key| (key == ENV_FALLBACK_TIMEOUT_MS).then(|| "9000".to_string()))
            .await
            .expect("load");

        assert_eq!(config.fallback.timeout_ms, 9000);
        assert_eq!(config.background.max_concurrent_starts, Some(1));
        assert_eq!(config.fallback_chain("2-code-search"), vec!["a/b"]);
    }

    #[tokio::test]
    async fn loader_treats_missing_files_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ConfigLoader::new()
            .with_global_path(dir.path().join("absent.json"))
            .with_project_dir(dir.path())
            .load_with_env(no_env)
            .await
            .expect("load");
        assert_eq!(config, PluginConfig::default());
    }

    #[tokio::test]
    async fn loader_reports_malformed_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("miya.json");
        std::fs::write(&path, "{ not json").expect("write");
        let err = ConfigLoader::new()
            .with_global_path(&path)
            .load_with_env(no_env)
            .await
            .expect_err("malformed");
        assert!(matches!(err, BackgroundError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn loader_rejects_invalid_merged_values() {
        let err = ConfigLoader::new()
            .without_global()
            .with_runtime_overrides(json!({ "fallback": { "timeoutMs": 0 } }))
            .load_with_env(no_env)
            .await
            .expect_err("invalid");
        assert!(err.to_string().contains("timeoutMs"));
    }
}
