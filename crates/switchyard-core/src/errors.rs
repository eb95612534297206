/// Per-frame decode failures. None of these are fatal to the connection:
/// the read loop logs them and moves on to the next frame.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unrecognized frame: {0}")]
    Unrecognized(String),
}

impl NormalizeError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingField(_) => "missing_field",
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}
