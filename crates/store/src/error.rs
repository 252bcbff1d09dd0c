use thiserror::Error;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An insert collided with an existing unique key.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A conditional update lost to a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend failed to execute an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            StoreError::NotFound("message abc".into()).to_string(),
            "not found: message abc"
        );
        assert_eq!(
            StoreError::Duplicate("id".into()).to_string(),
            "duplicate: id"
        );
    }
}
