use serde_json::{json, Value};
use thiserror::Error;

/// Reasons a `mining.submit` is rejected, carrying the numeric codes
/// sent back to miners on the wire.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShareError {
    /// A parameter failed a size or format check.
    #[error("{0}")]
    Malformed(String),

    #[error("job not found")]
    JobNotFound,

    #[error("duplicate share")]
    DuplicateShare,

    #[error("low difficulty share of {0}")]
    LowDifficulty(f64),

    #[error("unauthorized worker")]
    UnauthorizedWorker,

    #[error("not subscribed")]
    NotSubscribed,
}

impl ShareError {
    pub fn malformed(message: &str) -> Self {
        ShareError::Malformed(message.to_owned())
    }

    pub fn code(&self) -> i64 {
        match self {
            ShareError::Malformed(_) => 20,
            ShareError::JobNotFound => 21,
            ShareError::DuplicateShare => 22,
            ShareError::LowDifficulty(_) => 23,
            ShareError::UnauthorizedWorker => 24,
            ShareError::NotSubscribed => 25,
        }
    }

    /// The `error` field of a rejected submit reply: `[code, message, null]`.
    pub fn to_error_value(&self) -> Value {
        json!([self.code(), self.to_string(), Value::Null])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_messages() {
        assert_eq!(ShareError::malformed("incorrect size of extranonce2").code(), 20);
        assert_eq!(ShareError::JobNotFound.code(), 21);
        assert_eq!(ShareError::DuplicateShare.code(), 22);
        assert_eq!(ShareError::LowDifficulty(0.5).code(), 23);
        assert_eq!(ShareError::UnauthorizedWorker.code(), 24);
        assert_eq!(ShareError::NotSubscribed.code(), 25);
    }

    #[test]
    fn error_value_is_code_message_null() {
        let error = ShareError::LowDifficulty(0.125);
        assert_eq!(
            error.to_error_value(),
            json!([23, "low difficulty share of 0.125", Value::Null])
        );
    }
}
