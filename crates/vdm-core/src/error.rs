use thiserror::Error;

/// Normalized driver failure taxonomy.
///
/// Adapters translate backend-specific failures into these variants before
/// returning to the broker; the broker branches on variants only, never on
/// backend error content.
#[derive(Debug, Error)]
pub enum VmError {
    /// Machine id unknown to the backend.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// Machine type id unknown to the backend.
    #[error("machine type not found: {0}")]
    TypeNotFound(String),

    /// Bad backend credentials or endpoint. Fatal, never retried.
    #[error("backend authentication failed: {0}")]
    Auth(String),

    /// Administrator secret not yet generated by the guest. Folded into
    /// `Booting` by status queries, not a hard failure.
    #[error("administrator credentials not yet available")]
    CredentialsPending,

    /// A persistent row the backend expected (assignment, secret, registry
    /// entry) was missing. Implies drift between backend and store.
    #[error("{0}")]
    RecordMissing(String),

    /// Operation the backend cannot perform.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// Anything else the backend reported, including transient control-plane
    /// failures. Mutating calls are not retried; status polls are.
    #[error("backend error: {0}")]
    Backend(String),
}

impl VmError {
    /// Normalize an arbitrary transport/control-plane failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        VmError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_machine() {
        let err = VmError::NotFound("srv-1f2e".to_string());
        assert_eq!(err.to_string(), "machine not found: srv-1f2e");
    }

    #[test]
    fn test_backend_helper_wraps_display() {
        let err = VmError::backend("connection reset");
        assert!(matches!(err, VmError::Backend(_)));
        assert_eq!(err.to_string(), "backend error: connection reset");
    }
}
