//! Error types for coordination and discovery operations.
//!
//! Result codes of the coordination service fall into four classes:
//! - transient (connection loss): retried by [`RetryingClient`](crate::retry::RetryingClient)
//! - logical (no node, bad version, node exists, ...): surfaced immediately
//! - session (expiry, closed connection): handled as a state transition
//! - configuration (bad path, malformed symlink): reported as not-found by the resolver

use thiserror::Error;

/// Errors that can occur during coordination and discovery operations.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The connection to the coordination service was lost mid-request.
    /// The request may or may not have been applied.
    #[error("connection loss")]
    ConnectionLoss,

    /// The coordination service did not answer in time.
    #[error("operation timed out")]
    OperationTimeout,

    /// The session was invalidated by the coordination service.
    #[error("session expired")]
    SessionExpired,

    /// The connection was shut down and rejects new operations.
    #[error("connection closed")]
    Closed,

    /// The node does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// Expected version does not match the node's current version.
    #[error("bad version for {path}: expected {expected}, found {found}")]
    BadVersion {
        path: String,
        expected: i32,
        found: i32,
    },

    /// The node still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    /// The ACL is empty or references credentials the session lacks.
    #[error("invalid acl: {0}")]
    InvalidAcl(String),

    /// The session is not authorized for the operation.
    #[error("not authorized: {0}")]
    NoAuth(String),

    /// Malformed path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Serialization or deserialization of a property value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation is not supported by this store variant.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The store has been shut down.
    #[error("store is shut down")]
    ShutDown,

    /// Local cache database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordError>;

/// Failure class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection-loss class; safe to resubmit.
    Transient,
    /// Definite outcome reported by the coordination service.
    Logical,
    /// The session is gone (expired or closed).
    Session,
    /// Misconfiguration: bad paths, unsupported operations.
    Configuration,
    /// Failures of local resources (cache, serialization, I/O).
    Local,
}

impl CoordError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoordError::ConnectionLoss | CoordError::OperationTimeout => ErrorClass::Transient,
            CoordError::SessionExpired | CoordError::Closed | CoordError::ShutDown => {
                ErrorClass::Session
            }
            CoordError::NoNode(_)
            | CoordError::NodeExists(_)
            | CoordError::BadVersion { .. }
            | CoordError::NotEmpty(_)
            | CoordError::NoChildrenForEphemerals(_)
            | CoordError::InvalidAcl(_)
            | CoordError::NoAuth(_) => ErrorClass::Logical,
            CoordError::InvalidPath(_) | CoordError::Unsupported(_) => ErrorClass::Configuration,
            CoordError::Serialization(_) | CoordError::Database(_) | CoordError::Io(_) => {
                ErrorClass::Local
            }
        }
    }

    /// Returns true if resubmitting the operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns true for the not-found code.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordError::NoNode(_))
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Serialization(err.to_string())
    }
}
