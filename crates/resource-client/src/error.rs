//! Resource client errors

use thiserror::Error;

/// Errors that can occur when reading or writing cluster objects
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create rejected because the object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Update rejected because the object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object is missing a field required to address it
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Kubeconfig could not be loaded
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl ResourceError {
    /// Returns true when the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true when a create lost the race against another writer.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Returns true when an optimistic update was rejected.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<kube::Error> for ResourceError {
    fn from(err: kube::Error) -> Self {
        let status = match &err {
            kube::Error::Api(resp) => Some((resp.code, resp.reason.clone(), resp.message.clone())),
            _ => None,
        };

        match status {
            Some((404, _, message)) => Self::NotFound(message),
            Some((409, reason, message)) if reason == "AlreadyExists" => Self::AlreadyExists(message),
            Some((409, _, message)) => Self::Conflict(message),
            _ => Self::Kube(err),
        }
    }
}
