//! Abstract storage traits for canonry.
//!
//! These traits are the persistence boundary. The uniqueness constraints on
//! anchors, aliases and evidence are part of the contract: an implementation
//! must enforce them itself (in-memory indexes, unique indexes, or a
//! transaction around a check-then-insert).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entity::{
    AliasId, CanonicalEntity, EntityAlias, EntityEvidence, EntityId, EntityKind, EntryId,
    EvidenceId, OwnerId,
};
use crate::error::CanonryResult;
use crate::extraction::EntryRecord;
use crate::feedback::{CaseId, CaseStatus, FeedbackCase};
use crate::policy::PolicyVersion;
use crate::replay::{ReplayJob, ReplayJobId};

/// Errors raised by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// What a merge moved, so it can be undone.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MergeRecord {
    pub losing: EntityId,
    pub winning: EntityId,
    pub moved_aliases: Vec<AliasId>,
    pub moved_evidence: Vec<EvidenceId>,
    pub merged_at: DateTime<Utc>,
}

/// Canonical entities, aliases, evidence and the redirect map.
///
/// Lookups by anchor or alias return raw (possibly redirected) ids; callers
/// pass them through [`CanonicalStore::resolve_canonical`].
pub trait CanonicalStore: Send + Sync {
    /// Looks up the entity owning `(owner, kind, anchor(normalized_name))`.
    fn find_by_anchor(
        &self,
        owner: OwnerId,
        kind: &EntityKind,
        normalized_name: &str,
    ) -> CanonryResult<Option<CanonicalEntity>>;

    /// Entities of `owner` and `kind` carrying `normalized_alias`, oldest first.
    fn find_by_alias(
        &self,
        owner: OwnerId,
        kind: &EntityKind,
        normalized_alias: &str,
    ) -> CanonryResult<Vec<EntityId>>;

    /// Raw entity by id, without following redirects.
    fn get(&self, id: EntityId) -> CanonryResult<Option<CanonicalEntity>>;

    /// Inserts a new entity. Fails on a duplicate id or anchor.
    fn create(&self, entity: CanonicalEntity) -> CanonryResult<()>;

    /// Bumps `updated_at`.
    fn touch(&self, id: EntityId, at: DateTime<Utc>) -> CanonryResult<()>;

    /// Inserts an alias. Returns `false` if `(entity, normalized_alias)` exists.
    fn add_alias(&self, alias: EntityAlias) -> CanonryResult<bool>;

    /// Inserts evidence. Returns `false` if the uniqueness key exists.
    fn add_evidence(&self, evidence: EntityEvidence) -> CanonryResult<bool>;

    /// Aliases currently attached to `id`.
    fn aliases(&self, id: EntityId) -> CanonryResult<Vec<EntityAlias>>;

    /// Evidence currently attached to `id`.
    fn evidence(&self, id: EntityId) -> CanonryResult<Vec<EntityEvidence>>;

    /// All entities of an owner, redirected ones included.
    fn entities_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<CanonicalEntity>>;

    /// Merges `losing` into `winning`.
    ///
    /// # Errors
    /// - `NotFound` if either entity is missing
    /// - `Conflict` on owner mismatch, if `losing` is already redirected, or if
    ///   the edge would create a cycle
    fn merge(&self, losing: EntityId, winning: EntityId) -> CanonryResult<MergeRecord>;

    /// Removes the redirect leaving `losing` and moves its rows back.
    /// Returns `None` when `losing` was not redirected.
    fn unmerge(&self, losing: EntityId) -> CanonryResult<Option<MergeRecord>>;

    /// Direct redirect target of `id`.
    fn redirect_of(&self, id: EntityId) -> CanonryResult<Option<EntityId>>;

    /// Ids whose redirect chain passes through `id`.
    fn redirected_into(&self, id: EntityId) -> CanonryResult<BTreeSet<EntityId>>;

    /// Follows redirects to the live entity id.
    fn resolve_canonical(&self, id: EntityId) -> CanonryResult<EntityId>;

    /// Entry ids with evidence on `id` or on any id redirected into it.
    fn entries_referencing(&self, id: EntityId) -> CanonryResult<BTreeSet<EntryId>>;
}

/// Extraction records of processed entries, read back by replay.
pub trait EntryStore: Send + Sync {
    /// Inserts or replaces the record for `record.entry_id`.
    fn record(&self, record: EntryRecord) -> CanonryResult<()>;

    /// Entry by id.
    fn get(&self, id: EntryId) -> CanonryResult<Option<EntryRecord>>;

    /// All entries of an owner, ordered by recording time.
    fn list_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<EntryRecord>>;
}

/// Applied feedback cases: the policy action log.
pub trait FeedbackCaseStore: Send + Sync {
    /// Appends an applied case.
    ///
    /// Must fail with `Conflict(StalePolicyVersion)` unless
    /// `case.applied_policy_version == latest_version(owner) + 1`.
    fn append_applied(&self, case: FeedbackCase) -> CanonryResult<()>;

    /// Appends an applied revert case and marks `original` reverted, as one
    /// step: either both happen or neither does.
    ///
    /// Fails like [`FeedbackCaseStore::append_applied`], or with
    /// `Conflict(InvalidTransition)` if `original` cannot be reverted.
    /// Returns the updated original.
    fn append_revert(&self, revert: FeedbackCase, original: CaseId)
        -> CanonryResult<FeedbackCase>;

    /// Case by id.
    fn get(&self, id: CaseId) -> CanonryResult<Option<FeedbackCase>>;

    /// Moves a case to `status`, recording the superseding case if any.
    fn set_status(
        &self,
        id: CaseId,
        status: CaseStatus,
        superseded_by: Option<CaseId>,
    ) -> CanonryResult<FeedbackCase>;

    /// Applied (and later reverted) cases of an owner in version order.
    fn list_applied(&self, owner: OwnerId) -> CanonryResult<Vec<FeedbackCase>>;

    /// Latest applied version for an owner (`0` if none).
    fn latest_version(&self, owner: OwnerId) -> CanonryResult<PolicyVersion>;
}

/// Replay job records.
pub trait ReplayJobStore: Send + Sync {
    /// Inserts a new job.
    fn insert(&self, job: ReplayJob) -> CanonryResult<()>;

    /// Job by id.
    fn get(&self, id: ReplayJobId) -> CanonryResult<Option<ReplayJob>>;

    /// Replaces an existing job.
    fn update(&self, job: ReplayJob) -> CanonryResult<()>;

    /// Deletes a job that was never enqueued.
    fn remove(&self, id: ReplayJobId) -> CanonryResult<Option<ReplayJob>>;

    /// Jobs of an owner, oldest first.
    fn list_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<ReplayJob>>;
}
