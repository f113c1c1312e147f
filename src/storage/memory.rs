//! In-memory storage backend.
//!
//! Thread-safe implementations of the storage traits, enforcing every
//! uniqueness constraint with in-memory indexes. Used for embedded usage,
//! tests, and as the reference implementation for real backends.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::entity::{
    AliasId, CanonicalEntity, EntityAlias, EntityEvidence, EntityId, EntityKind, EntryId,
    EvidenceId, EvidenceKey, OwnerId,
};
use crate::error::{CanonryResult, ConflictError, NotFoundError};
use crate::extraction::EntryRecord;
use crate::feedback::{CaseId, CaseStatus, FeedbackCase};
use crate::normalize;
use crate::policy::PolicyVersion;
use crate::redirect::{RedirectError, RedirectMap, DEFAULT_HOP_LIMIT};
use crate::replay::{ReplayJob, ReplayJobId};
use crate::storage::traits::{
    CanonicalStore, EntryStore, FeedbackCaseStore, MergeRecord, ReplayJobStore, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn redirect_err(err: RedirectError) -> StorageError {
    StorageError::BackendError(format!("redirect map corrupted: {err}"))
}

type AliasKey = (OwnerId, EntityKind, String);

#[derive(Debug, Default)]
struct CanonicalState {
    entities: HashMap<EntityId, CanonicalEntity>,
    anchors: HashMap<(OwnerId, String), EntityId>,
    aliases: HashMap<AliasId, EntityAlias>,
    aliases_by_entity: HashMap<EntityId, Vec<AliasId>>,
    alias_pairs: HashSet<(EntityId, String)>,
    alias_index: HashMap<AliasKey, Vec<AliasId>>,
    evidence: HashMap<EvidenceId, EntityEvidence>,
    evidence_by_entity: HashMap<EntityId, Vec<EvidenceId>>,
    evidence_keys: HashSet<EvidenceKey>,
    redirects: RedirectMap,
    merges: HashMap<EntityId, MergeRecord>,
}

impl CanonicalState {
    fn with_hop_limit(hop_limit: usize) -> Self {
        Self {
            redirects: RedirectMap::with_hop_limit(hop_limit),
            ..Self::default()
        }
    }

    fn entity(&self, id: EntityId) -> Result<&CanonicalEntity, NotFoundError> {
        self.entities.get(&id).ok_or(NotFoundError::Entity(id))
    }

    fn alias_key(&self, entity_id: EntityId, normalized_alias: &str) -> Option<AliasKey> {
        self.entities
            .get(&entity_id)
            .map(|e| (e.owner_id, e.kind.clone(), normalized_alias.to_string()))
    }

    fn insert_alias(&mut self, alias: EntityAlias) {
        if let Some(key) = self.alias_key(alias.entity_id, &alias.normalized_alias) {
            self.alias_index.entry(key).or_default().push(alias.id);
        }
        self.alias_pairs
            .insert((alias.entity_id, alias.normalized_alias.clone()));
        self.aliases_by_entity
            .entry(alias.entity_id)
            .or_default()
            .push(alias.id);
        self.aliases.insert(alias.id, alias);
    }

    /// Re-homes an alias row. Returns false if the target already has it.
    fn move_alias(&mut self, id: AliasId, to: EntityId) -> bool {
        let Some(alias) = self.aliases.get(&id).cloned() else {
            return false;
        };
        if alias.entity_id == to || self.alias_pairs.contains(&(to, alias.normalized_alias.clone()))
        {
            return false;
        }
        if let Some(key) = self.alias_key(alias.entity_id, &alias.normalized_alias) {
            if let Some(ids) = self.alias_index.get_mut(&key) {
                ids.retain(|a| *a != id);
                if ids.is_empty() {
                    self.alias_index.remove(&key);
                }
            }
        }
        self.alias_pairs
            .remove(&(alias.entity_id, alias.normalized_alias.clone()));
        if let Some(ids) = self.aliases_by_entity.get_mut(&alias.entity_id) {
            ids.retain(|a| *a != id);
        }
        let mut moved = alias;
        moved.entity_id = to;
        self.insert_alias(moved);
        true
    }

    fn insert_evidence(&mut self, evidence: EntityEvidence) {
        self.evidence_keys.insert(evidence.key());
        self.evidence_by_entity
            .entry(evidence.entity_id)
            .or_default()
            .push(evidence.id);
        self.evidence.insert(evidence.id, evidence);
    }

    fn move_evidence(&mut self, id: EvidenceId, to: EntityId) -> bool {
        let Some(row) = self.evidence.get(&id).cloned() else {
            return false;
        };
        if row.entity_id == to || self.evidence_keys.contains(&row.key_for(to)) {
            return false;
        }
        self.evidence_keys.remove(&row.key());
        if let Some(ids) = self.evidence_by_entity.get_mut(&row.entity_id) {
            ids.retain(|e| *e != id);
        }
        let mut moved = row;
        moved.entity_id = to;
        self.insert_evidence(moved);
        true
    }

    fn head(&self, id: EntityId) -> Result<EntityId, StorageError> {
        self.redirects.resolve(id).map_err(redirect_err)
    }
}

/// Thread-safe in-memory canonical entity store.
#[derive(Debug)]
pub struct InMemoryCanonicalStore {
    state: RwLock<CanonicalState>,
}

impl Default for InMemoryCanonicalStore {
    fn default() -> Self {
        Self::with_hop_limit(DEFAULT_HOP_LIMIT)
    }
}

impl InMemoryCanonicalStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose redirect traversal stops after `hop_limit` hops.
    #[must_use]
    pub fn with_hop_limit(hop_limit: usize) -> Self {
        Self {
            state: RwLock::new(CanonicalState::with_hop_limit(hop_limit)),
        }
    }
}

impl CanonicalStore for InMemoryCanonicalStore {
    fn find_by_anchor(
        &self,
        owner: OwnerId,
        kind: &EntityKind,
        normalized_name: &str,
    ) -> CanonryResult<Option<CanonicalEntity>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.find_by_anchor"))?;
        let key = (owner, normalize::anchor_key(kind, normalized_name));
        Ok(state
            .anchors
            .get(&key)
            .and_then(|id| state.entities.get(id))
            .cloned())
    }

    fn find_by_alias(
        &self,
        owner: OwnerId,
        kind: &EntityKind,
        normalized_alias: &str,
    ) -> CanonryResult<Vec<EntityId>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.find_by_alias"))?;
        let key = (owner, kind.clone(), normalized_alias.to_string());
        let mut found: Vec<&CanonicalEntity> = state
            .alias_index
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|alias_id| state.aliases.get(alias_id))
            .filter_map(|alias| state.entities.get(&alias.entity_id))
            .collect();
        found.sort_by_key(|e| (e.created_at, e.id));
        found.dedup_by_key(|e| e.id);
        Ok(found.into_iter().map(|e| e.id).collect())
    }

    fn get(&self, id: EntityId) -> CanonryResult<Option<CanonicalEntity>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.get"))?;
        Ok(state.entities.get(&id).cloned())
    }

    fn create(&self, entity: CanonicalEntity) -> CanonryResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err("canonical.create"))?;
        if state.entities.contains_key(&entity.id) {
            return Err(StorageError::DuplicateKey(entity.id.to_string()).into());
        }
        let anchor = (entity.owner_id, entity.anchor_key.clone());
        if state.anchors.contains_key(&anchor) {
            return Err(ConflictError::DuplicateAnchor {
                owner: entity.owner_id,
                anchor_key: entity.anchor_key,
            }
            .into());
        }
        state.anchors.insert(anchor, entity.id);
        state.entities.insert(entity.id, entity);
        Ok(())
    }

    fn touch(&self, id: EntityId, at: DateTime<Utc>) -> CanonryResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err("canonical.touch"))?;
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or(NotFoundError::Entity(id))?;
        if at > entity.updated_at {
            entity.updated_at = at;
        }
        Ok(())
    }

    fn add_alias(&self, alias: EntityAlias) -> CanonryResult<bool> {
        let mut state = self.state.write().map_err(|_| lock_err("canonical.add_alias"))?;
        state.entity(alias.entity_id)?;
        if state
            .alias_pairs
            .contains(&(alias.entity_id, alias.normalized_alias.clone()))
        {
            return Ok(false);
        }
        state.insert_alias(alias);
        Ok(true)
    }

    fn add_evidence(&self, evidence: EntityEvidence) -> CanonryResult<bool> {
        let mut state = self.state.write().map_err(|_| lock_err("canonical.add_evidence"))?;
        state.entity(evidence.entity_id)?;
        if state.evidence_keys.contains(&evidence.key()) {
            return Ok(false);
        }
        state.insert_evidence(evidence);
        Ok(true)
    }

    fn aliases(&self, id: EntityId) -> CanonryResult<Vec<EntityAlias>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.aliases"))?;
        Ok(state
            .aliases_by_entity
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|a| state.aliases.get(a))
            .cloned()
            .collect())
    }

    fn evidence(&self, id: EntityId) -> CanonryResult<Vec<EntityEvidence>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.evidence"))?;
        Ok(state
            .evidence_by_entity
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|e| state.evidence.get(e))
            .cloned()
            .collect())
    }

    fn entities_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<CanonicalEntity>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.entities_for_owner"))?;
        let mut out: Vec<CanonicalEntity> = state
            .entities
            .values()
            .filter(|e| e.owner_id == owner)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.created_at, e.id));
        Ok(out)
    }

    fn merge(&self, losing: EntityId, winning: EntityId) -> CanonryResult<MergeRecord> {
        let mut state = self.state.write().map_err(|_| lock_err("canonical.merge"))?;
        let losing_owner = state.entity(losing)?.owner_id;
        let winning_owner = state.entity(winning)?.owner_id;
        if losing_owner != winning_owner {
            return Err(ConflictError::OwnerMismatch {
                a: losing,
                b: winning,
            }
            .into());
        }
        if let Some(target) = state.redirects.target(losing) {
            return Err(ConflictError::AlreadyRedirected { id: losing, target }.into());
        }
        let head = state.head(winning)?;
        if head == losing {
            return Err(ConflictError::RedirectCycle { losing, winning }.into());
        }

        let alias_ids = state.aliases_by_entity.get(&losing).cloned().unwrap_or_default();
        let moved_aliases: Vec<AliasId> = alias_ids
            .into_iter()
            .filter(|id| state.move_alias(*id, head))
            .collect();
        let evidence_ids = state.evidence_by_entity.get(&losing).cloned().unwrap_or_default();
        let moved_evidence: Vec<EvidenceId> = evidence_ids
            .into_iter()
            .filter(|id| state.move_evidence(*id, head))
            .collect();

        state
            .redirects
            .insert(losing, winning)
            .map_err(|_| ConflictError::RedirectCycle { losing, winning })?;

        let record = MergeRecord {
            losing,
            winning,
            moved_aliases,
            moved_evidence,
            merged_at: Utc::now(),
        };
        state.merges.insert(losing, record.clone());
        Ok(record)
    }

    fn unmerge(&self, losing: EntityId) -> CanonryResult<Option<MergeRecord>> {
        let mut state = self.state.write().map_err(|_| lock_err("canonical.unmerge"))?;
        if state.redirects.remove(losing).is_none() {
            return Ok(None);
        }
        let Some(record) = state.merges.remove(&losing) else {
            return Ok(None);
        };
        for id in &record.moved_aliases {
            state.move_alias(*id, losing);
        }
        for id in &record.moved_evidence {
            state.move_evidence(*id, losing);
        }
        Ok(Some(record))
    }

    fn redirect_of(&self, id: EntityId) -> CanonryResult<Option<EntityId>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.redirect_of"))?;
        Ok(state.redirects.target(id))
    }

    fn redirected_into(&self, id: EntityId) -> CanonryResult<BTreeSet<EntityId>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.redirected_into"))?;
        Ok(state.redirects.upstream(id))
    }

    fn resolve_canonical(&self, id: EntityId) -> CanonryResult<EntityId> {
        let state = self.state.read().map_err(|_| lock_err("canonical.resolve_canonical"))?;
        Ok(state.head(id)?)
    }

    fn entries_referencing(&self, id: EntityId) -> CanonryResult<BTreeSet<EntryId>> {
        let state = self.state.read().map_err(|_| lock_err("canonical.entries_referencing"))?;
        let mut ids = state.redirects.upstream(id);
        ids.insert(id);
        Ok(ids
            .iter()
            .filter_map(|e| state.evidence_by_entity.get(e))
            .flatten()
            .filter_map(|ev| state.evidence.get(ev))
            .map(|ev| ev.source_entry_id)
            .collect())
    }
}

/// Thread-safe in-memory entry store.
#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    entries: RwLock<HashMap<EntryId, EntryRecord>>,
}

impl InMemoryEntryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for InMemoryEntryStore {
    fn record(&self, record: EntryRecord) -> CanonryResult<()> {
        let mut entries = self.entries.write().map_err(|_| lock_err("entry.record"))?;
        entries.insert(record.entry_id, record);
        Ok(())
    }

    fn get(&self, id: EntryId) -> CanonryResult<Option<EntryRecord>> {
        let entries = self.entries.read().map_err(|_| lock_err("entry.get"))?;
        Ok(entries.get(&id).cloned())
    }

    fn list_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<EntryRecord>> {
        let entries = self.entries.read().map_err(|_| lock_err("entry.list_for_owner"))?;
        let mut out: Vec<EntryRecord> = entries
            .values()
            .filter(|r| r.owner_id == owner)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.recorded_at, r.entry_id));
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct CaseState {
    cases: HashMap<CaseId, FeedbackCase>,
    log: HashMap<OwnerId, Vec<CaseId>>,
}

impl CaseState {
    fn latest(&self, owner: OwnerId) -> PolicyVersion {
        self.log
            .get(&owner)
            .and_then(|ids| ids.last())
            .and_then(|id| self.cases.get(id))
            .and_then(|c| c.applied_policy_version)
            .unwrap_or(PolicyVersion::ZERO)
    }

    /// Checks that `case` may be appended as the owner's next version.
    fn check_append(&self, case: &FeedbackCase) -> CanonryResult<()> {
        if self.cases.contains_key(&case.id) {
            return Err(StorageError::DuplicateKey(case.id.to_string()).into());
        }
        if case.status != CaseStatus::Applied {
            return Err(ConflictError::InvalidTransition {
                case_id: case.id,
                from: case.status.to_string(),
                to: CaseStatus::Applied.to_string(),
            }
            .into());
        }
        let latest = self.latest(case.owner_id);
        let version = case.applied_policy_version.unwrap_or(PolicyVersion::ZERO);
        if version != latest.next() {
            return Err(ConflictError::StalePolicyVersion {
                expected: version.prev(),
                actual: latest,
            }
            .into());
        }
        Ok(())
    }
}

/// Thread-safe in-memory feedback case log.
#[derive(Debug, Default)]
pub struct InMemoryFeedbackCaseStore {
    state: RwLock<CaseState>,
}

impl InMemoryFeedbackCaseStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeedbackCaseStore for InMemoryFeedbackCaseStore {
    fn append_applied(&self, case: FeedbackCase) -> CanonryResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err("case.append_applied"))?;
        state.check_append(&case)?;
        state.log.entry(case.owner_id).or_default().push(case.id);
        state.cases.insert(case.id, case);
        Ok(())
    }

    fn append_revert(
        &self,
        revert: FeedbackCase,
        original: CaseId,
    ) -> CanonryResult<FeedbackCase> {
        let mut state = self.state.write().map_err(|_| lock_err("case.append_revert"))?;
        state.check_append(&revert)?;
        let target = state.cases.get(&original).ok_or(NotFoundError::Case(original))?;
        if target.owner_id != revert.owner_id
            || !target.status.can_transition_to(CaseStatus::Reverted)
        {
            return Err(ConflictError::InvalidTransition {
                case_id: original,
                from: target.status.to_string(),
                to: CaseStatus::Reverted.to_string(),
            }
            .into());
        }

        let revert_id = revert.id;
        state.log.entry(revert.owner_id).or_default().push(revert_id);
        state.cases.insert(revert_id, revert);
        let target = state.cases.get_mut(&original).ok_or(NotFoundError::Case(original))?;
        target.status = CaseStatus::Reverted;
        target.superseded_by = Some(revert_id);
        Ok(target.clone())
    }

    fn get(&self, id: CaseId) -> CanonryResult<Option<FeedbackCase>> {
        let state = self.state.read().map_err(|_| lock_err("case.get"))?;
        Ok(state.cases.get(&id).cloned())
    }

    fn set_status(
        &self,
        id: CaseId,
        status: CaseStatus,
        superseded_by: Option<CaseId>,
    ) -> CanonryResult<FeedbackCase> {
        let mut state = self.state.write().map_err(|_| lock_err("case.set_status"))?;
        let case = state.cases.get_mut(&id).ok_or(NotFoundError::Case(id))?;
        if !case.status.can_transition_to(status) {
            return Err(ConflictError::InvalidTransition {
                case_id: id,
                from: case.status.to_string(),
                to: status.to_string(),
            }
            .into());
        }
        case.status = status;
        if superseded_by.is_some() {
            case.superseded_by = superseded_by;
        }
        Ok(case.clone())
    }

    fn list_applied(&self, owner: OwnerId) -> CanonryResult<Vec<FeedbackCase>> {
        let state = self.state.read().map_err(|_| lock_err("case.list_applied"))?;
        Ok(state
            .log
            .get(&owner)
            .into_iter()
            .flatten()
            .filter_map(|id| state.cases.get(id))
            .cloned()
            .collect())
    }

    fn latest_version(&self, owner: OwnerId) -> CanonryResult<PolicyVersion> {
        let state = self.state.read().map_err(|_| lock_err("case.latest_version"))?;
        Ok(state.latest(owner))
    }
}

/// Thread-safe in-memory replay job store.
#[derive(Debug, Default)]
pub struct InMemoryReplayJobStore {
    jobs: RwLock<HashMap<ReplayJobId, ReplayJob>>,
}

impl InMemoryReplayJobStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplayJobStore for InMemoryReplayJobStore {
    fn insert(&self, job: ReplayJob) -> CanonryResult<()> {
        let mut jobs = self.jobs.write().map_err(|_| lock_err("job.insert"))?;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(job.id.to_string()).into());
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    fn get(&self, id: ReplayJobId) -> CanonryResult<Option<ReplayJob>> {
        let jobs = self.jobs.read().map_err(|_| lock_err("job.get"))?;
        Ok(jobs.get(&id).cloned())
    }

    fn update(&self, job: ReplayJob) -> CanonryResult<()> {
        let mut jobs = self.jobs.write().map_err(|_| lock_err("job.update"))?;
        let slot = jobs.get_mut(&job.id).ok_or(NotFoundError::Job(job.id))?;
        *slot = job;
        Ok(())
    }

    fn remove(&self, id: ReplayJobId) -> CanonryResult<Option<ReplayJob>> {
        let mut jobs = self.jobs.write().map_err(|_| lock_err("job.remove"))?;
        Ok(jobs.remove(&id))
    }

    fn list_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<ReplayJob>> {
        let jobs = self.jobs.read().map_err(|_| lock_err("job.list_for_owner"))?;
        let mut out: Vec<ReplayJob> = jobs
            .values()
            .filter(|j| j.owner_id == owner)
            .cloned()
            .collect();
        out.sort_by_key(|j| (j.created_at, j.id));
        Ok(out)
    }
}
