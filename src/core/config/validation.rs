use serde_json::{Map, Value};

use super::settings::StoreBackend;
use crate::core::errors::RagError;

/// Checks the merged configuration tree before it is deserialized.
///
/// Absent keys are fine (defaults apply); present keys must have the right
/// type and range.
pub fn validate_config(config: &Value) -> Result<(), RagError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(api) = expect_optional_object(root, "api")? {
        validate_optional_string_field(api, "api.api_key", "api_key")?;
        validate_optional_string_field(api, "api.base_url", "base_url")?;
        validate_optional_string_field(api, "api.model", "model")?;
        validate_optional_string_field(api, "api.embedding_model", "embedding_model")?;
        validate_u64_field(api, "api.timeout_secs", "timeout_secs", 1, 86_400)?;
    }

    if let Some(chunk) = expect_optional_object(root, "chunk")? {
        validate_u64_field(chunk, "chunk.size", "size", 1, 10_000_000)?;
        validate_u64_field(chunk, "chunk.overlap", "overlap", 0, 10_000_000)?;
    }

    if let Some(retrieval) = expect_optional_object(root, "retrieval")? {
        validate_u64_field(retrieval, "retrieval.top_k", "top_k", 1, 10_000)?;
        validate_f64_field(retrieval, "retrieval.threshold", "threshold", -1.0, 1.0)?;
        validate_f64_field(retrieval, "retrieval.mmr_lambda", "mmr_lambda", 0.0, 1.0)?;
        validate_f64_field(
            retrieval,
            "retrieval.recency_weight",
            "recency_weight",
            0.0,
            1.0,
        )?;
        validate_u64_field(
            retrieval,
            "retrieval.recency_oversample",
            "recency_oversample",
            1,
            1_000,
        )?;
    }

    if let Some(store) = expect_optional_object(root, "store")? {
        validate_choice_field(store, "store.backend", "backend", &StoreBackend::NAMES)?;
        validate_optional_string_field(store, "store.path", "path")?;
    }

    if let Some(postgres) = expect_optional_object(root, "postgres")? {
        validate_optional_string_field(postgres, "postgres.host", "host")?;
        validate_u64_field(postgres, "postgres.port", "port", 1, 65535)?;
        validate_optional_string_field(postgres, "postgres.user", "user")?;
        validate_optional_string_field(postgres, "postgres.password", "password")?;
        validate_optional_string_field(postgres, "postgres.dbname", "dbname")?;
        validate_optional_string_field(postgres, "postgres.sslmode", "sslmode")?;
        validate_optional_string_field(postgres, "postgres.table", "table")?;
    }

    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, RagError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(config_type_error(key, "object")),
        None => Ok(None),
    }
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(RagError::InvalidInput(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_f64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: f64,
    max: f64,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_f64() else {
        return Err(config_type_error(path, "number"));
    };
    if !(min..=max).contains(&number) {
        return Err(RagError::InvalidInput(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_choice_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    allowed: &[&str],
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if !allowed.contains(&text) {
        return Err(RagError::InvalidInput(format!(
            "Invalid config at '{}': expected one of {}",
            path,
            allowed.join(", ")
        )));
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), RagError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.as_str().is_none() {
        return Err(config_type_error(path, "string"));
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> RagError {
    RagError::InvalidInput(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}
