//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value parsed but is unusable (zero capacity, empty host).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: SettingsError = io_err.into();
        assert!(matches!(err, SettingsError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn json_error_display() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: SettingsError = json_err.into();
        assert!(err.to_string().contains("parse settings JSON"));
    }

    #[test]
    fn invalid_value_display() {
        let err = SettingsError::InvalidValue("dispatch.cacheCapacity must be > 0".into());
        assert_eq!(
            err.to_string(),
            "invalid settings value: dispatch.cacheCapacity must be > 0"
        );
    }
}
