use thiserror::Error;

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry no longer accepts writes or subscriptions.
    #[error("registry is shut down")]
    ShutDown,
    /// Record rejected before reaching a holder.
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
}

#[cfg(test)]
mod tests {
    use super::RegistryError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(RegistryError::ShutDown.to_string(), "registry is shut down");
        assert_eq!(
            RegistryError::InvalidRecord("empty id").to_string(),
            "invalid record: empty id"
        );
    }
}
