//! Error types for the Sporos operator

use thiserror::Error;

/// Main error type for Sporos operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Certificate or key generation error
    #[error(transparent)]
    Pki(#[from] crate::pki::PkiError),

    /// A generated asset was looked up under a name that does not exist
    ///
    /// Proceeding with a zero-value asset would silently persist empty
    /// certificate data into a Secret, so this always hard-fails.
    #[error("asset {0:?} does not exist")]
    MissingAsset(String),

    /// Validation error for CRD specs or derived values
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Kubeconfig construction or parsing error
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// The bounded post-bootstrap health poll exceeded its deadline
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl Error {
    /// Create a missing-asset error for the given asset name
    pub fn missing_asset(name: impl Into<String>) -> Self {
        Self::MissingAsset(name.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a timeout error naming what was being waited for
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A misspelled asset name fails loudly instead of embedding
    /// empty bytes into a Secret.
    #[test]
    fn story_missing_asset_carries_the_name() {
        let err = Error::missing_asset("apiserver.crt");
        assert!(err.to_string().contains("apiserver.crt"));
        assert!(err.to_string().contains("does not exist"));

        match Error::missing_asset("ca.key") {
            Error::MissingAsset(name) => assert_eq!(name, "ca.key"),
            _ => panic!("Expected MissingAsset variant"),
        }
    }

    /// Story: The health poll deadline is the single fatal failure point
    /// in the state machine, and its error says what was being polled.
    #[test]
    fn story_timeout_names_what_was_polled() {
        let err = Error::timeout("hosted API server health");
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("hosted API server health"));
    }

    /// Story: Error helper functions accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let cluster = "demo";
        let err = Error::validation(format!("Sporos {cluster} has no namespace"));
        assert!(err.to_string().contains("demo"));

        let err = Error::serialization("static message");
        assert!(err.to_string().contains("static message"));
    }

    /// Story: Errors are categorized for proper handling in the reconciler
    ///
    /// Generation errors are fatal for the attempt; read failures are retried
    /// by the caller's error policy; timeouts surface operationally.
    #[test]
    fn story_error_categorization_for_controller_handling() {
        fn categorize(err: &Error) -> &'static str {
            match err {
                Error::Pki(_) => "fail_attempt",
                Error::Kube(_) => "retry",
                Error::MissingAsset(_) => "fail_attempt",
                Error::Validation(_) => "reject",
                Error::Serialization(_) => "reject",
                Error::Kubeconfig(_) => "fail_attempt",
                Error::Timeout(_) => "fail_attempt",
            }
        }

        assert_eq!(categorize(&Error::missing_asset("x")), "fail_attempt");
        assert_eq!(categorize(&Error::validation("bad cidr")), "reject");
        assert_eq!(categorize(&Error::timeout("healthz")), "fail_attempt");
    }
}
