//! Error types for canonry.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! exact condition: a malformed correction, a stale policy version, a redirect
//! cycle, a missing record, or a storage failure.

use thiserror::Error;

use crate::entity::{EntityId, EntryId, OwnerId};
use crate::feedback::CaseId;
use crate::policy::PolicyVersion;
use crate::replay::ReplayJobId;
use crate::storage::StorageError;

/// Validation errors: malformed input rejected before any mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Label normalizes to an empty key: '{label}'")]
    EmptyLabel { label: String },

    #[error("Required field '{field}' is missing")]
    MissingField { field: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong { field: String, max_length: usize },

    #[error("Unknown template id: {template_id}")]
    UnknownTemplate { template_id: String },

    #[error("Invalid payload for template '{template_id}': {reason}")]
    InvalidPayload { template_id: String, reason: String },

    #[error("Invalid action #{index}: {reason}")]
    InvalidAction { index: usize, reason: String },

    #[error("Invalid pattern rule: {reason}")]
    InvalidPatternRule { reason: String },

    #[error("A feedback case must contain at least one action")]
    EmptyActionSet,

    #[error("Policy log for owner {owner} is not contiguous: expected version {expected}, found {found}")]
    NonContiguousLog {
        owner: OwnerId,
        expected: PolicyVersion,
        found: PolicyVersion,
    },

    #[error("Policy version {requested} is ahead of the latest version {latest}")]
    VersionAhead {
        requested: PolicyVersion,
        latest: PolicyVersion,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Conflicts: the operation is well-formed but collides with current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("Stale policy version: case was previewed at {expected}, current is {actual}")]
    StalePolicyVersion {
        expected: PolicyVersion,
        actual: PolicyVersion,
    },

    #[error("Merging {losing} into {winning} would create a redirect cycle")]
    RedirectCycle { losing: EntityId, winning: EntityId },

    #[error("Entity {id} is already redirected to {target}")]
    AlreadyRedirected { id: EntityId, target: EntityId },

    #[error("Entities {a} and {b} belong to different owners")]
    OwnerMismatch { a: EntityId, b: EntityId },

    #[error("Invalid status transition for case {case_id}: {from} -> {to}")]
    InvalidTransition {
        case_id: CaseId,
        from: String,
        to: String,
    },

    #[error("Duplicate anchor key '{anchor_key}' for owner {owner}")]
    DuplicateAnchor { owner: OwnerId, anchor_key: String },
}

/// A referenced record does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFoundError {
    #[error("Entity not found: {0}")]
    Entity(EntityId),

    #[error("Entry not found: {0}")]
    Entry(EntryId),

    #[error("Feedback case not found: {0}")]
    Case(CaseId),

    #[error("Replay job not found: {0}")]
    Job(ReplayJobId),
}

/// Replay queue failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("Replay queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Replay workers are shut down")]
    Disconnected,
}

/// Top-level error type for canonry.
#[derive(Debug, Error)]
pub enum CanonryError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Store error: {0}")]
    Store(#[from] StorageError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CanonryError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if a referenced record was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this error came from the storage layer.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if the caller may retry the operation unchanged.
    ///
    /// Store failures and a full replay queue are transient. A stale policy
    /// version is not retryable as-is: the caller must re-preview.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => matches!(
                e,
                StorageError::BackendError(_) | StorageError::ConnectionError(_)
            ),
            Self::Replay(ReplayError::QueueFull { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for canonry operations.
pub type CanonryResult<T> = Result<T, CanonryError>;
