//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::VigilSettings;

/// `~/.vigil`, falling back to `/tmp/.vigil` without a home directory.
pub fn vigil_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vigil")
}

/// Resolve the path to the settings file (`~/.vigil/settings.json`).
pub fn settings_path() -> PathBuf {
    vigil_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<VigilSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<VigilSettings> {
    let defaults = serde_json::to_value(VigilSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: VigilSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `VIGIL_*` environment variables to loaded settings.
pub fn apply_env_overrides(settings: &mut VigilSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any variable source.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Anything else is
/// ignored with a warning.
pub fn apply_overrides(settings: &mut VigilSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("VIGIL_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = env.u64("VIGIL_MAX_STEPS", 1, 10_000) {
        settings.engine.max_steps = v as u32;
    }
    if let Some(v) = env.u64("VIGIL_TOOL_TIMEOUT_MS", 100, 3_600_000) {
        settings.engine.tool_timeout_ms = v;
    }
    if let Some(v) = env.u64("VIGIL_APPROVAL_TIMEOUT_MS", 100, 604_800_000) {
        settings.engine.approval_timeout_ms = v;
    }
    if let Some(v) = env.u64("VIGIL_APPROVAL_POLL_MS", 10, 60_000) {
        settings.engine.approval_poll_ms = v;
    }
    if let Some(v) = env.u64("VIGIL_MAX_DELEGATION_DEPTH", 0, 16) {
        settings.engine.max_delegation_depth = v as u32;
    }
    if let Some(v) = env.string("VIGIL_LOG_LEVEL") {
        if parse_level(&v).is_some() {
            settings.logging.level = v.to_lowercase();
        } else {
            warn!(key = "VIGIL_LOG_LEVEL", value = %v, "invalid log level env var, ignoring");
        }
    }
    if let Some(v) = env.bool("VIGIL_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a string as a boolean.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Accepts the five `tracing` level names, case-insensitive.
pub fn parse_level(val: &str) -> Option<&'static str> {
    match val.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn temp_settings(content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vigil-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn deep_merge_nested_objects() {
        let merged = deep_merge(
            json!({"engine": {"maxSteps": 50, "childPollMs": 1000}}),
            json!({"engine": {"maxSteps": 10}}),
        );
        assert_eq!(merged["engine"]["maxSteps"], 10);
        assert_eq!(merged["engine"]["childPollMs"], 1000);
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let merged = deep_merge(json!({"level": "info"}), json!({"level": null}));
        assert_eq!(merged["level"], "info");
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2, 3]}), json!({"a": [9]}));
        assert_eq!(merged["a"], json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("vigil-missing-{}.json", uuid::Uuid::now_v7()));
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.engine.max_steps, 50);
    }

    #[test]
    fn file_values_override_defaults() {
        let path = temp_settings(r#"{"engine": {"approvalTimeoutMs": 2500}, "logging": {"json": true}}"#);
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.engine.approval_timeout_ms, 2500);
        assert!(settings.logging.json);
        assert_eq!(settings.engine.max_steps, 50);
    }

    #[test]
    fn invalid_json_is_error() {
        let path = temp_settings("{not json");
        assert!(matches!(
            load_settings_from_path(&path),
            Err(crate::SettingsError::Json(_))
        ));
    }

    #[test]
    fn zero_limit_in_file_is_error() {
        let path = temp_settings(r#"{"engine": {"maxSteps": 0}}"#);
        assert!(matches!(
            load_settings_from_path(&path),
            Err(crate::SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = VigilSettings::default();
        apply_overrides(
            &mut settings,
            vars(&[
                ("VIGIL_DB_PATH", "/data/v.db"),
                ("VIGIL_MAX_STEPS", "12"),
                ("VIGIL_APPROVAL_POLL_MS", "250"),
                ("VIGIL_LOG_LEVEL", "DEBUG"),
                ("VIGIL_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.database.path, "/data/v.db");
        assert_eq!(settings.engine.max_steps, 12);
        assert_eq!(settings.engine.approval_poll_ms, 250);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = VigilSettings::default();
        apply_overrides(
            &mut settings,
            vars(&[
                ("VIGIL_MAX_STEPS", "0"),
                ("VIGIL_APPROVAL_TIMEOUT_MS", "soon"),
                ("VIGIL_LOG_LEVEL", "loud"),
                ("VIGIL_LOG_JSON", "maybe"),
                ("VIGIL_DB_PATH", ""),
            ]),
        );
        let defaults = VigilSettings::default();
        assert_eq!(settings.engine.max_steps, defaults.engine.max_steps);
        assert_eq!(settings.engine.approval_timeout_ms, defaults.engine.approval_timeout_ms);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.json);
        assert_eq!(settings.database.path, "vigil.db");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_level("Warn"), Some("warn"));
        assert_eq!(parse_level("verbose"), None);
    }
}
