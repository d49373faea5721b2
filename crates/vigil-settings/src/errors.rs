//! Settings errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed settings file: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but is out of range for the engine.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_names_the_file_problem() {
        let err: SettingsError = serde_json::from_str::<serde_json::Value>("{engine").unwrap_err().into();
        assert!(err.to_string().starts_with("malformed settings file"));
    }

    #[test]
    fn invalid_value_carries_the_field() {
        let err = SettingsError::InvalidValue("engine.maxSteps must be at least 1".into());
        assert_eq!(err.to_string(), "invalid settings value: engine.maxSteps must be at least 1");
    }
}
