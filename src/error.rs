//! Error types for the irsa-operator

use thiserror::Error;

/// Main error type for reconciliation and IAM operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Policy document (de)serialization error
    #[error("policy serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid operator configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Required object metadata is missing
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// An IAM operation failed for a reason other than the classified cases
    #[error("iam {op} failed: {message}")]
    Iam {
        /// The IAM operation that failed (e.g. `CreateRole`)
        op: String,
        /// Failure detail reported by the cloud provider
        message: String,
    },

    /// The named IAM entity does not exist
    #[error("iam entity not found: {0}")]
    IamNotFound(String),

    /// An IAM entity with the requested name already exists
    #[error("iam entity already exists: {0}")]
    IamAlreadyExists(String),

    /// The IAM role is expected to exist but has not been provisioned yet
    #[error("iam role has not been created")]
    RoleNotCreated,

    /// A service account with the IRSA's name exists but is owned by someone else
    #[error("service account already exists and is not managed by irsa-operator")]
    ServiceAccountConflict,

    /// An IAM role with the derived name exists but is not tagged as operator-owned
    #[error("iam role already exists and is not managed by irsa-operator")]
    IamRoleConflict,
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an IAM operation error with the given operation name and message
    pub fn iam(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Iam {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error means the target IAM entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::IamNotFound(_))
    }

    /// Returns true if the error means the IAM entity name is already taken
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::IamAlreadyExists(_))
    }

    /// Returns true for ownership conflicts that wait for user intervention
    /// rather than being retried on a timer
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ServiceAccountConflict | Self::IamRoleConflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_predicates_match_their_variants() {
        assert!(Error::IamNotFound("role".into()).is_not_found());
        assert!(!Error::IamNotFound("role".into()).is_already_exists());

        assert!(Error::IamAlreadyExists("role".into()).is_already_exists());
        assert!(!Error::IamAlreadyExists("role".into()).is_not_found());

        assert!(Error::ServiceAccountConflict.is_conflict());
        assert!(Error::IamRoleConflict.is_conflict());
        assert!(!Error::iam("GetRole", "boom").is_conflict());
    }

    /// Story: the status writer publishes `Error::to_string()` as the status
    /// reason, so messages must stand on their own for a user reading
    /// `kubectl get irsa`.
    #[test]
    fn messages_are_self_describing() {
        let err = Error::iam("CreateRole", "access denied");
        assert!(err.to_string().contains("CreateRole"));
        assert!(err.to_string().contains("access denied"));

        let err = Error::ServiceAccountConflict;
        assert!(err.to_string().contains("not managed by irsa-operator"));

        let err = Error::config("clusterName is required");
        assert!(err.to_string().contains("clusterName"));
    }
}
