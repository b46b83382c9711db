//! Error types for the Marionette runtime

use thiserror::Error;

/// Main error type for Marionette operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid or unresolvable MetaController configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or malformed parent label selector
    #[error("selector error: {0}")]
    Selector(String),

    /// Child adoption or release failure
    #[error("claim error: {0}")]
    Claim(String),

    /// Sync webhook transport, status, or decode failure
    #[error("hook failed: {0}")]
    Hook(String),

    /// Child create/update/delete failure
    #[error("apply error: {0}")]
    Apply(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Accumulated errors from independent child operations
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a selector error with the given message
    pub fn selector(msg: impl Into<String>) -> Self {
        Self::Selector(msg.into())
    }

    /// Create a claim error with the given message
    pub fn claim(msg: impl Into<String>) -> Self {
        Self::Claim(msg.into())
    }

    /// Create a hook error with the given message
    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    /// Create an apply error with the given message
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Fold a list of independent errors into a single result
    ///
    /// Returns `Ok(())` for an empty list, the error itself for a single
    /// entry, and an [`Error::Aggregate`] otherwise.
    pub fn aggregate(mut errs: Vec<Error>) -> crate::Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Error::Aggregate(errs)),
        }
    }

    /// True if this is an optimistic-concurrency conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// True if the API server reported the object as gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} for test"),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn test_conflict_classification() {
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(404, "NotFound").is_conflict());
        assert!(!Error::claim("adopt lost a race").is_conflict());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(409, "Conflict").is_not_found());
    }

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(Error::aggregate(Vec::new()).is_ok());
    }

    #[test]
    fn test_aggregate_single_unwraps() {
        let err = Error::aggregate(vec![Error::hook("connection refused")]).unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        assert_eq!(err.to_string(), "hook failed: connection refused");
    }

    #[test]
    fn test_aggregate_joins_messages() {
        let err = Error::aggregate(vec![
            Error::claim("can't adopt pod-a"),
            Error::configuration("unknown resource widgets"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("can't adopt pod-a"));
        assert!(msg.contains("unknown resource widgets"));
        assert!(msg.contains("; "));
    }

    #[test]
    fn test_helper_constructors_accept_strings() {
        let name = "frontend";
        let err = Error::selector(format!("{name} has no spec.selector"));
        assert!(err.to_string().contains("frontend"));

        let err = Error::hook("static message");
        assert!(err.to_string().contains("static message"));
    }
}
