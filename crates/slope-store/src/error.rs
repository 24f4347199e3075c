/// Failure taxonomy shared by every store implementation.
///
/// Only `Transient` is worth retrying; everything else is a permanent answer
/// from the store for that request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The principal may not perform this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Network failure, timeout or an unavailable store.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Permanent rejection: constraint violation, malformed row, unknown column.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(StoreError::Transient("timeout".into()).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
        assert!(!StoreError::Unauthorized("x".into()).is_retryable());
        assert!(!StoreError::Rejected("x".into()).is_retryable());
    }
}
