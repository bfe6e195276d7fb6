//! `lxdstore::error` contains the error types shared by all store implementations.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a store-related operation.
pub type StoreResult<T> = Result<T, StoreError>;

/// The kinds of objects a store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A pod-level profile object.
    Profile,

    /// A runnable instance object.
    Instance,

    /// A managed bridge network object.
    Network,
}

/// An error that occurred during a store operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// The kind of the missing object.
        kind: ObjectKind,

        /// The name of the missing object.
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// The kind of the conflicting object.
        kind: ObjectKind,

        /// The name of the conflicting object.
        name: String,
    },

    /// The presented version token no longer matches the stored object.
    #[error("stale version token for {kind} {name}")]
    Conflict {
        /// The kind of the contested object.
        kind: ObjectKind,

        /// The name of the contested object.
        name: String,
    },

    /// An update was attempted without a version token.
    #[error("empty version token presented for update of {kind} {name}")]
    EmptyVersionToken {
        /// The kind of the object being updated.
        kind: ObjectKind,

        /// The name of the object being updated.
        name: String,
    },

    /// The object is still referenced by other objects.
    #[error("{kind} {name} is still in use")]
    InUse {
        /// The kind of the referenced object.
        kind: ObjectKind,

        /// The name of the referenced object.
        name: String,
    },

    /// The instance must be stopped before the operation can proceed.
    #[error("instance is running: {0}")]
    InstanceRunning(String),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StoreError {
    /// Creates a new `StoreError` from an arbitrary error.
    pub fn custom(error: impl Into<anyhow::Error>) -> StoreError {
        StoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns true if the error is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Returns true if the error is a stale version token conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Profile => write!(f, "profile"),
            ObjectKind::Instance => write!(f, "instance"),
            ObjectKind::Network => write!(f, "network"),
        }
    }
}

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        let not_found = StoreError::NotFound {
            kind: ObjectKind::Profile,
            name: "p1".to_string(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = StoreError::Conflict {
            kind: ObjectKind::Instance,
            name: "c1".to_string(),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());
    }

    #[test]
    fn test_error_display_names_kind_and_object() {
        let err = StoreError::NotFound {
            kind: ObjectKind::Network,
            name: "lxdlet0".to_string(),
        };
        assert_eq!(err.to_string(), "network not found: lxdlet0");
    }
}
