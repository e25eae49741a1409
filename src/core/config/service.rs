use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::paths::AppPaths;
use super::settings::AppConfig;
use super::validation::validate_config;
use crate::core::errors::RagError;

const REDACT_PLACEHOLDER: &str = "****";

const SENSITIVE_PATTERNS: [&str; 6] = [
    "api_key",
    "secret",
    "password",
    "_token",
    "token_",
    "credential",
];

const SENSITIVE_WHITELIST: [&str; 2] = ["max_tokens", "tokens"];

/// Environment variable, config section, key, and whether the value is numeric.
const ENV_OVERRIDES: [(&str, &str, &str, bool); 11] = [
    ("OPENAI_API_KEY", "api", "api_key", false),
    ("OPENAI_API_BASE_URL", "api", "base_url", false),
    ("OPENAI_MODEL", "api", "model", false),
    ("OPENAI_EMBEDDING_MODEL", "api", "embedding_model", false),
    ("POSTGRES_HOST", "postgres", "host", false),
    ("POSTGRES_PORT", "postgres", "port", true),
    ("POSTGRES_USER", "postgres", "user", false),
    ("POSTGRES_PASSWORD", "postgres", "password", false),
    ("POSTGRES_DBNAME", "postgres", "dbname", false),
    ("POSTGRES_SSLMODE", "postgres", "sslmode", false),
    ("RAG_STORE_BACKEND", "store", "backend", false),
];

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("RAG_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        self.paths.data_dir.join("config.yml")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.paths.secrets_path.clone()
    }

    pub fn dotenv_path(&self) -> PathBuf {
        self.paths.data_dir.join(".env")
    }

    /// Loads `config.yml`, layers `secrets.yaml` and the environment (process
    /// variables, then `.env`) on top, validates the result and deserializes it.
    pub fn load_config(&self) -> Result<AppConfig, RagError> {
        let dotenv = read_dotenv(&self.dotenv_path());
        self.load_config_with(layered_lookup(|name| env::var(name).ok(), dotenv))
    }

    pub fn load_config_with<F>(&self, lookup: F) -> Result<AppConfig, RagError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let merged = self.load_value(lookup)?;
        validate_config(&merged)?;
        let config: AppConfig = serde_json::from_value(merged)
            .map_err(|e| RagError::InvalidInput(format!("Invalid config: {}", e)))?;
        tracing::debug!("Loaded configuration from {}", self.config_path().display());
        Ok(config)
    }

    /// Merged configuration tree with secrets masked, for diagnostics.
    pub fn redacted_config(&self) -> Result<Value, RagError> {
        let dotenv = read_dotenv(&self.dotenv_path());
        let merged = self.load_value(layered_lookup(|name| env::var(name).ok(), dotenv))?;
        Ok(redact_sensitive_values(&merged))
    }

    fn load_value<F>(&self, lookup: F) -> Result<Value, RagError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let public_config = load_yaml_file(&self.config_path())?;
        let secrets_config = load_yaml_file(&self.secrets_path())?;
        let mut merged = deep_merge(&public_config, &secrets_config);
        apply_env_overrides(&mut merged, lookup);
        Ok(merged)
    }
}

/// Missing file yields an empty tree; unreadable or malformed YAML is an error.
fn load_yaml_file(path: &Path) -> Result<Value, RagError> {
    if !path.exists() {
        return Ok(Value::Object(Map::new()));
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        RagError::InvalidInput(format!("Failed to read config {}: {}", path.display(), e))
    })?;
    if contents.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value = serde_yaml::from_str::<Value>(&contents).map_err(|e| {
        RagError::InvalidInput(format!("Malformed config {}: {}", path.display(), e))
    })?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(RagError::InvalidInput(format!(
            "Malformed config {}: expected a mapping at the top level",
            path.display()
        ))),
    }
}

/// `KEY=value` pairs from a dotenv file. A missing file yields none.
fn read_dotenv(path: &Path) -> HashMap<String, String> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return HashMap::new(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
            return HashMap::new();
        }
    };

    let mut values = HashMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                values.insert(key, value);
            }
            Err(e) => tracing::warn!("Skipping malformed line in {}: {}", path.display(), e),
        }
    }
    tracing::debug!("Read {} variables from {}", values.len(), path.display());
    values
}

/// Process variables take precedence; `.env` only fills the gaps.
fn layered_lookup<F>(process: F, dotenv: HashMap<String, String>) -> impl Fn(&str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    move |name| process(name).or_else(|| dotenv.get(name).cloned())
}

fn apply_env_overrides<F>(config: &mut Value, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let Value::Object(root) = config else {
        return;
    };

    for (var, section, key, numeric) in ENV_OVERRIDES {
        let Some(raw) = lookup(var).filter(|v| !v.is_empty()) else {
            continue;
        };
        let value = if numeric {
            match raw.trim().parse::<u64>() {
                Ok(n) => Value::from(n),
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric {}={}", var, raw);
                    continue;
                }
            }
        } else {
            Value::String(raw)
        };

        let entry = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
    }
}

fn deep_merge(base: &Value, override_value: &Value) -> Value {
    match (base, override_value) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in override_map {
                let merged_value = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => override_value.clone(),
    }
}

fn redact_sensitive_values(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) && !val.is_null() {
                    redacted.insert(key.clone(), Value::String(REDACT_PLACEHOLDER.to_string()));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_values(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_values).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    if SENSITIVE_WHITELIST
        .iter()
        .any(|allowed| *allowed == key_lower)
    {
        return false;
    }
    SENSITIVE_PATTERNS
        .iter()
        .any(|pattern| key_lower.contains(pattern))
}
