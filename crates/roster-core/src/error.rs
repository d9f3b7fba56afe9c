use thiserror::Error;

/// Failure to build or apply a single-field delta.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    /// The named field is not part of the record model.
    #[error("unknown delta field: {0}")]
    UnknownField(String),
    /// The value carried for a known field has the wrong shape.
    #[error("invalid value for delta field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    /// Delta addressed to a different record.
    #[error("delta for {actual} applied to {expected}")]
    IdMismatch { expected: String, actual: String },
}

#[cfg(test)]
mod tests {
    use super::DeltaError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            DeltaError::UnknownField("color".into()).to_string(),
            "unknown delta field: color"
        );
        assert_eq!(
            DeltaError::InvalidValue {
                field: "status".into(),
                reason: "expected text".into()
            }
            .to_string(),
            "invalid value for delta field status: expected text"
        );
        assert_eq!(
            DeltaError::IdMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .to_string(),
            "delta for b applied to a"
        );
    }
}
