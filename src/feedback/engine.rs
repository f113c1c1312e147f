//! Preview, apply and revert of feedback cases.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CanonryConfig;
use crate::engine::OwnerLocks;
use crate::entity::{EntityId, OwnerId};
use crate::error::{CanonryError, CanonryResult, ConflictError, NotFoundError, ValidationError};
use crate::policy::{fold_case, PolicyAction, PolicyProvider};
use crate::replay::{ReplayExecutor, ReplayJob, ReplayJobId, ReplayQueue};
use crate::storage::{
    CanonicalStore, EntryStore, FeedbackCaseStore, MergeRecord, ReplayJobStore, Stores,
};

use super::case::{CaseId, CaseStatus, FeedbackCase, Scope};
use super::impact::{self, ImpactSummary};
use super::inverse;
use super::template::{TemplateCatalog, TemplateRequest, REVERT_TEMPLATE};

/// A parsed, unpersisted case and what it would do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasePreview {
    /// Draft case; pass it to [`FeedbackEngine::apply`] unchanged.
    pub case: FeedbackCase,
    pub impact: ImpactSummary,
    pub warnings: Vec<String>,
    /// Fingerprint of the ruleset the case would produce.
    pub candidate_fingerprint: String,
}

/// Result of applying (or reverting) a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCase {
    pub case: FeedbackCase,
    pub impact: ImpactSummary,
    pub job_id: ReplayJobId,
}

/// Turns corrections into policy versions and replay jobs.
pub struct FeedbackEngine {
    canonical: Arc<dyn CanonicalStore>,
    entries: Arc<dyn EntryStore>,
    cases: Arc<dyn FeedbackCaseStore>,
    jobs: Arc<dyn ReplayJobStore>,
    policy: Arc<PolicyProvider>,
    executor: Arc<ReplayExecutor>,
    queue: Arc<dyn ReplayQueue>,
    locks: Arc<OwnerLocks>,
    catalog: TemplateCatalog,
    dry_run_preview: bool,
    hop_limit: usize,
}

impl std::fmt::Debug for FeedbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackEngine")
            .field("catalog", &self.catalog)
            .field("dry_run_preview", &self.dry_run_preview)
            .finish_non_exhaustive()
    }
}

impl FeedbackEngine {
    #[must_use]
    pub fn new(
        stores: &Stores,
        policy: Arc<PolicyProvider>,
        executor: Arc<ReplayExecutor>,
        queue: Arc<dyn ReplayQueue>,
        locks: Arc<OwnerLocks>,
        config: &CanonryConfig,
    ) -> Self {
        Self {
            canonical: Arc::clone(&stores.canonical),
            entries: Arc::clone(&stores.entries),
            cases: Arc::clone(&stores.cases),
            jobs: Arc::clone(&stores.jobs),
            policy,
            executor,
            queue,
            locks,
            catalog: TemplateCatalog::builtin(),
            dry_run_preview: config.feedback.dry_run_preview,
            hop_limit: config.redirect_hop_limit,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut TemplateCatalog {
        &mut self.catalog
    }

    /// Parses `request` against the owner's current version without
    /// persisting anything.
    ///
    /// # Errors
    /// [`ValidationError`] for malformed payloads; store errors.
    pub fn preview(
        &self,
        owner: OwnerId,
        actor: &str,
        scope: Scope,
        request: &TemplateRequest,
    ) -> CanonryResult<CasePreview> {
        let base = self.policy.current(owner)?;
        let mut case = FeedbackCase::draft(
            owner,
            actor,
            scope,
            request.template_id.clone(),
            request.payload.clone(),
            Vec::new(),
            base.version,
        );
        case.actions = self.catalog.parse(case.id, request)?;

        let (mut impact, warnings) = impact::analyze(
            self.canonical.as_ref(),
            self.entries.as_ref(),
            owner,
            &case.actions,
            &base,
        )?;
        let candidate = fold_case(&base, &case);
        if self.dry_run_preview {
            impact.dry_run = Some(self.executor.dry_run_entries(
                owner,
                &impact.entries_to_replay,
                &candidate,
            )?);
        }
        for warning in &warnings {
            tracing::warn!(owner = %owner, case = %case.id, warning = %warning, "feedback preview warning");
        }
        tracing::debug!(
            owner = %owner,
            case = %case.id,
            template = %case.template_id,
            base_version = %base.version,
            actions = case.actions.len(),
            entries = impact.entries_to_replay.len(),
            "previewed feedback case"
        );

        let candidate_fingerprint = candidate
            .fingerprint()
            .map_err(|e| CanonryError::internal(format!("ruleset fingerprint: {e}")))?;
        Ok(CasePreview {
            case,
            impact,
            warnings,
            candidate_fingerprint,
        })
    }

    /// Applies a previewed draft at `current + 1` and enqueues its replay.
    ///
    /// # Errors
    /// - `Conflict(StalePolicyVersion)` if another case was applied since
    ///   the preview
    /// - `Conflict` if the merge plan would create a cycle or re-merge an
    ///   already redirected entity
    /// - [`ValidationError`] if the actions no longer validate
    pub fn apply(&self, case: FeedbackCase) -> CanonryResult<AppliedCase> {
        let owner = case.owner_id;
        let applied = self.locks.with_owner(owner, || self.apply_locked(case, None))?;
        self.enqueue(&applied);
        Ok(applied)
    }

    /// Undoes an applied case by applying its inverse as a new case.
    ///
    /// # Errors
    /// - `NotFound` if the case does not exist
    /// - `Conflict(InvalidTransition)` unless the case is applied
    /// - any error [`FeedbackEngine::apply`] can return
    pub fn revert(&self, case_id: CaseId, actor: &str) -> CanonryResult<AppliedCase> {
        let owner = self.load(case_id)?.owner_id;
        let applied = self.locks.with_owner(owner, || -> CanonryResult<AppliedCase> {
            let original = self.load(case_id)?;
            if original.status != CaseStatus::Applied {
                return Err(ConflictError::InvalidTransition {
                    case_id,
                    from: original.status.to_string(),
                    to: CaseStatus::Reverted.to_string(),
                }
                .into());
            }
            let version = original
                .applied_policy_version
                .ok_or_else(|| CanonryError::internal(format!("applied case {case_id} has no version")))?;
            let before = self.policy.at_version(owner, version.prev())?;
            let inverses = inverse::invert(&before, &original.actions);

            let current = self.cases.latest_version(owner)?;
            let mut revert = FeedbackCase::draft(
                owner,
                actor,
                original.scope,
                REVERT_TEMPLATE,
                serde_json::json!({ "reverts": case_id }),
                inverses,
                current,
            );
            revert.reverts = Some(case_id);

            let applied = self.apply_locked(revert, Some(case_id))?;
            tracing::info!(
                owner = %owner,
                case = %case_id,
                revert_case = %applied.case.id,
                "reverted feedback case"
            );
            Ok(applied)
        })?;
        self.enqueue(&applied);
        Ok(applied)
    }

    /// Case by id.
    ///
    /// # Errors
    /// Store errors.
    pub fn get_case(&self, case_id: CaseId) -> CanonryResult<Option<FeedbackCase>> {
        self.cases.get(case_id)
    }

    fn load(&self, case_id: CaseId) -> CanonryResult<FeedbackCase> {
        self.cases
            .get(case_id)?
            .ok_or_else(|| NotFoundError::Case(case_id).into())
    }

    /// Applies a draft while the owner lock is held. `supersedes` names the
    /// case a revert undoes; it is marked reverted in the same store write
    /// that appends the revert.
    fn apply_locked(
        &self,
        mut case: FeedbackCase,
        supersedes: Option<CaseId>,
    ) -> CanonryResult<AppliedCase> {
        let owner = case.owner_id;
        if case.status != CaseStatus::Draft {
            return Err(ConflictError::InvalidTransition {
                case_id: case.id,
                from: case.status.to_string(),
                to: CaseStatus::Applied.to_string(),
            }
            .into());
        }
        let current = self.cases.latest_version(owner)?;
        if case.base_policy_version != current {
            return Err(ConflictError::StalePolicyVersion {
                expected: case.base_policy_version,
                actual: current,
            }
            .into());
        }
        validate_actions(&case)?;
        self.check_merge_plan(owner, &case.actions)?;

        let base = self.policy.at_version(owner, current)?;
        let (impact, warnings) = impact::analyze(
            self.canonical.as_ref(),
            self.entries.as_ref(),
            owner,
            &case.actions,
            &base,
        )?;
        for warning in &warnings {
            tracing::warn!(owner = %owner, case = %case.id, warning = %warning, "feedback apply warning");
        }

        let version = current.next();
        case.mark_applied(version);
        let undo = self.materialize(&case.actions)?;

        let job = ReplayJob::new(owner, case.id, version, impact.entries_to_replay.clone());
        let job_id = job.id;
        if let Err(e) = self.jobs.insert(job) {
            self.rollback(&undo);
            return Err(e);
        }

        // The version only becomes visible once everything that can fail has
        // succeeded.
        let appended = match supersedes {
            Some(original) => self.cases.append_revert(case.clone(), original).map(drop),
            None => self.cases.append_applied(case.clone()),
        };
        if let Err(e) = appended {
            self.rollback(&undo);
            if let Err(remove_err) = self.jobs.remove(job_id) {
                tracing::warn!(job = %job_id, error = %remove_err, "failed to drop orphaned replay job");
            }
            return Err(e);
        }
        self.policy.invalidate(owner);

        tracing::info!(
            owner = %owner,
            case = %case.id,
            template = %case.template_id,
            version = %version,
            actions = case.actions.len(),
            entities = impact.impacted_entities.len(),
            entries = impact.entries_to_replay.len(),
            job = %job_id,
            "applied feedback case"
        );
        Ok(AppliedCase {
            case,
            impact,
            job_id,
        })
    }

    /// Simulates the case's merges and unmerges against the store's
    /// redirect map, rejecting plans the store would refuse.
    fn check_merge_plan(&self, owner: OwnerId, actions: &[PolicyAction]) -> CanonryResult<()> {
        let mut planned: HashMap<EntityId, Option<EntityId>> = HashMap::new();
        for action in actions {
            match action {
                PolicyAction::MergeEntities {
                    losing_id,
                    winning_id,
                } => {
                    for id in [*losing_id, *winning_id] {
                        let entity = self.canonical.get(id)?.ok_or(NotFoundError::Entity(id))?;
                        if entity.owner_id != owner {
                            return Err(ConflictError::OwnerMismatch {
                                a: *losing_id,
                                b: *winning_id,
                            }
                            .into());
                        }
                    }
                    if let Some(target) = self.planned_target(&planned, *losing_id)? {
                        return Err(ConflictError::AlreadyRedirected {
                            id: *losing_id,
                            target,
                        }
                        .into());
                    }
                    if self.planned_head(&planned, *winning_id)? == *losing_id {
                        return Err(ConflictError::RedirectCycle {
                            losing: *losing_id,
                            winning: *winning_id,
                        }
                        .into());
                    }
                    planned.insert(*losing_id, Some(*winning_id));
                }
                PolicyAction::Unmerge { losing_id } => {
                    planned.insert(*losing_id, None);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn planned_target(
        &self,
        planned: &HashMap<EntityId, Option<EntityId>>,
        id: EntityId,
    ) -> CanonryResult<Option<EntityId>> {
        match planned.get(&id) {
            Some(target) => Ok(*target),
            None => self.canonical.redirect_of(id),
        }
    }

    fn planned_head(
        &self,
        planned: &HashMap<EntityId, Option<EntityId>>,
        start: EntityId,
    ) -> CanonryResult<EntityId> {
        let mut seen = HashSet::new();
        let mut current = start;
        for _ in 0..self.hop_limit {
            if !seen.insert(current) {
                break;
            }
            match self.planned_target(planned, current)? {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(CanonryError::internal(format!(
            "redirect chain from {start} does not terminate"
        )))
    }

    /// Runs the case's merges and unmerges. On error the steps already
    /// taken are undone before returning.
    fn materialize(&self, actions: &[PolicyAction]) -> CanonryResult<Vec<Materialized>> {
        let mut done = Vec::new();
        for action in actions {
            let step = match action {
                PolicyAction::MergeEntities {
                    losing_id,
                    winning_id,
                } => self.canonical.merge(*losing_id, *winning_id).map(|record| {
                    tracing::debug!(
                        losing = %losing_id,
                        winning = %winning_id,
                        aliases = record.moved_aliases.len(),
                        evidence = record.moved_evidence.len(),
                        "merged entities"
                    );
                    Some(Materialized::Merged(record.losing))
                }),
                PolicyAction::Unmerge { losing_id } => {
                    self.canonical.unmerge(*losing_id).map(|record| match record {
                        Some(record) => Some(Materialized::Unmerged(record)),
                        None => {
                            tracing::debug!(losing = %losing_id, "unmerge of an unmerged entity");
                            None
                        }
                    })
                }
                _ => Ok(None),
            };
            match step {
                Ok(Some(step)) => done.push(step),
                Ok(None) => {}
                Err(e) => {
                    self.rollback(&done);
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    /// Undoes materialized steps, newest first. Failures are logged; the
    /// caller is already returning an error.
    fn rollback(&self, done: &[Materialized]) {
        for step in done.iter().rev() {
            let result = match step {
                Materialized::Merged(losing) => self.canonical.unmerge(*losing).map(drop),
                Materialized::Unmerged(record) => {
                    self.canonical.merge(record.losing, record.winning).map(drop)
                }
            };
            if let Err(e) = result {
                tracing::warn!(step = ?step, error = %e, "failed to roll back materialized step");
            }
        }
    }

    fn enqueue(&self, applied: &AppliedCase) {
        if let Err(e) = self.queue.enqueue_replay(applied.job_id) {
            tracing::warn!(
                case = %applied.case.id,
                job = %applied.job_id,
                error = %e,
                "failed to enqueue replay job; it stays queued"
            );
        }
    }
}

/// A store change made while applying a case, kept so it can be undone.
#[derive(Debug)]
enum Materialized {
    Merged(EntityId),
    Unmerged(MergeRecord),
}

fn validate_actions(case: &FeedbackCase) -> Result<(), ValidationError> {
    if case.actions.is_empty() && !case.is_revert() {
        return Err(ValidationError::EmptyActionSet);
    }
    for (index, action) in case.actions.iter().enumerate() {
        action
            .validate()
            .map_err(|reason| ValidationError::InvalidAction { index, reason })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::config::ResolverConfig;
    use crate::entity::{CanonicalEntity, EntityKind};
    use crate::policy::{BlockScope, PolicyVersion};
    use crate::resolver::EntityResolver;
    use crate::storage::{InMemoryCanonicalStore, StorageError};
    use serde_json::json;

    /// Records enqueued ids instead of running them.
    #[derive(Default)]
    struct RecordingQueue {
        enqueued: Mutex<Vec<ReplayJobId>>,
    }

    impl ReplayQueue for RecordingQueue {
        fn enqueue_replay(&self, job_id: ReplayJobId) -> CanonryResult<()> {
            self.enqueued
                .lock()
                .map_err(|_| CanonryError::internal("poisoned"))?
                .push(job_id);
            Ok(())
        }
    }

    fn engine(stores: &Stores, queue: Arc<RecordingQueue>) -> FeedbackEngine {
        let config = CanonryConfig::default();
        let locks = Arc::new(OwnerLocks::new());
        let policy = Arc::new(PolicyProvider::new(Arc::clone(&stores.cases)));
        let resolver = Arc::new(EntityResolver::new(
            Arc::clone(&stores.canonical),
            ResolverConfig::default(),
        ));
        let executor = Arc::new(ReplayExecutor::new(
            resolver,
            Arc::clone(&policy),
            Arc::clone(&stores.entries),
            Arc::clone(&locks),
        ));
        FeedbackEngine::new(stores, policy, executor, queue, locks, &config)
    }

    fn entity(stores: &Stores, owner: OwnerId, name: &str) -> EntityId {
        let e = CanonicalEntity::new(owner, EntityKind::Person, name, name.to_lowercase());
        let id = e.id;
        stores.canonical.create(e).unwrap();
        id
    }

    #[test]
    fn test_apply_bumps_version_and_enqueues() {
        let stores = Stores::in_memory();
        let queue = Arc::new(RecordingQueue::default());
        let engine = engine(&stores, Arc::clone(&queue));
        let owner = OwnerId::new();

        let preview = engine
            .preview(
                owner,
                "me",
                Scope::User,
                &TemplateRequest::new("block_token", json!({"token": "Mario", "scope": "person"})),
            )
            .unwrap();
        assert_eq!(preview.case.status, CaseStatus::Draft);
        assert_eq!(stores.cases.latest_version(owner).unwrap(), PolicyVersion::ZERO);

        let applied = engine.apply(preview.case).unwrap();
        assert_eq!(applied.case.applied_policy_version, Some(PolicyVersion::new(1)));
        assert_eq!(stores.cases.latest_version(owner).unwrap(), PolicyVersion::new(1));
        assert_eq!(*queue.enqueued.lock().unwrap(), vec![applied.job_id]);

        let job = stores.jobs.get(applied.job_id).unwrap().unwrap();
        assert_eq!(job.policy_version, PolicyVersion::new(1));
        assert_eq!(job.case_id, applied.case.id);
    }

    #[test]
    fn test_stale_preview_conflicts() {
        let stores = Stores::in_memory();
        let engine = engine(&stores, Arc::new(RecordingQueue::default()));
        let owner = OwnerId::new();
        let request = TemplateRequest::new("block_token", json!({"token": "x"}));

        let first = engine.preview(owner, "me", Scope::User, &request).unwrap();
        let second = engine.preview(owner, "me", Scope::User, &request).unwrap();
        engine.apply(first.case).unwrap();

        let err = engine.apply(second.case).unwrap_err();
        assert!(matches!(
            err,
            CanonryError::Conflict(ConflictError::StalePolicyVersion { .. })
        ));
        assert_eq!(stores.cases.latest_version(owner).unwrap(), PolicyVersion::new(1));
    }

    #[test]
    fn test_cycle_precheck_leaves_version_unchanged() {
        let stores = Stores::in_memory();
        let engine = engine(&stores, Arc::new(RecordingQueue::default()));
        let owner = OwnerId::new();
        let (a, b) = (entity(&stores, owner, "A"), entity(&stores, owner, "B"));

        let preview = engine
            .preview(
                owner,
                "me",
                Scope::User,
                &TemplateRequest::new(
                    "batch",
                    json!({"actions": [
                        {"action": "merge_entities", "losing_id": a, "winning_id": b},
                        {"action": "merge_entities", "losing_id": b, "winning_id": a}
                    ]}),
                ),
            )
            .unwrap();
        let err = engine.apply(preview.case).unwrap_err();
        assert!(matches!(
            err,
            CanonryError::Conflict(ConflictError::RedirectCycle { .. })
        ));
        assert_eq!(stores.cases.latest_version(owner).unwrap(), PolicyVersion::ZERO);
        assert_eq!(stores.canonical.resolve_canonical(a).unwrap(), a);
    }

    #[test]
    fn test_revert_restores_ruleset() {
        let stores = Stores::in_memory();
        let engine = engine(&stores, Arc::new(RecordingQueue::default()));
        let owner = OwnerId::new();
        let (a, b) = (entity(&stores, owner, "A"), entity(&stores, owner, "B"));

        let preview = engine
            .preview(
                owner,
                "me",
                Scope::User,
                &TemplateRequest::new(
                    "batch",
                    json!({"actions": [
                        {"action": "block_token", "token": "zz", "scope": "goal"},
                        {"action": "merge_entities", "losing_id": a, "winning_id": b}
                    ]}),
                ),
            )
            .unwrap();
        let applied = engine.apply(preview.case).unwrap();
        assert_eq!(stores.canonical.resolve_canonical(a).unwrap(), b);

        let reverted = engine.revert(applied.case.id, "me").unwrap();
        assert_eq!(reverted.case.applied_policy_version, Some(PolicyVersion::new(2)));
        assert_eq!(reverted.case.reverts, Some(applied.case.id));
        assert_eq!(stores.canonical.resolve_canonical(a).unwrap(), a);

        let original = engine.get_case(applied.case.id).unwrap().unwrap();
        assert_eq!(original.status, CaseStatus::Reverted);
        assert_eq!(original.superseded_by, Some(reverted.case.id));

        let v2 = engine.policy.current(owner).unwrap();
        assert!(v2.redirects.is_empty());
        assert!(!v2.blocked_tokens.contains_key(&BlockScope::Goal));

        let err = engine.revert(applied.case.id, "me").unwrap_err();
        assert!(err.is_conflict());
    }

    /// Delegates to an in-memory store but fails the `fail_at`-th merge.
    struct FlakyCanonical {
        inner: InMemoryCanonicalStore,
        merges: AtomicUsize,
        fail_at: AtomicUsize,
    }

    impl FlakyCanonical {
        fn failing_merge(fail_at: usize) -> Self {
            Self {
                inner: InMemoryCanonicalStore::new(),
                merges: AtomicUsize::new(0),
                fail_at: AtomicUsize::new(fail_at),
            }
        }

        fn heal(&self) {
            self.fail_at.store(usize::MAX, Ordering::SeqCst);
        }
    }

    impl CanonicalStore for FlakyCanonical {
        fn find_by_anchor(
            &self,
            owner: OwnerId,
            kind: &EntityKind,
            normalized_name: &str,
        ) -> CanonryResult<Option<CanonicalEntity>> {
            self.inner.find_by_anchor(owner, kind, normalized_name)
        }
        fn find_by_alias(
            &self,
            owner: OwnerId,
            kind: &EntityKind,
            normalized_alias: &str,
        ) -> CanonryResult<Vec<EntityId>> {
            self.inner.find_by_alias(owner, kind, normalized_alias)
        }
        fn get(&self, id: EntityId) -> CanonryResult<Option<CanonicalEntity>> {
            self.inner.get(id)
        }
        fn create(&self, entity: CanonicalEntity) -> CanonryResult<()> {
            self.inner.create(entity)
        }
        fn touch(&self, id: EntityId, at: chrono::DateTime<chrono::Utc>) -> CanonryResult<()> {
            self.inner.touch(id, at)
        }
        fn add_alias(&self, alias: crate::entity::EntityAlias) -> CanonryResult<bool> {
            self.inner.add_alias(alias)
        }
        fn add_evidence(&self, evidence: crate::entity::EntityEvidence) -> CanonryResult<bool> {
            self.inner.add_evidence(evidence)
        }
        fn aliases(&self, id: EntityId) -> CanonryResult<Vec<crate::entity::EntityAlias>> {
            self.inner.aliases(id)
        }
        fn evidence(&self, id: EntityId) -> CanonryResult<Vec<crate::entity::EntityEvidence>> {
            self.inner.evidence(id)
        }
        fn entities_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<CanonicalEntity>> {
            self.inner.entities_for_owner(owner)
        }
        fn merge(&self, losing: EntityId, winning: EntityId) -> CanonryResult<MergeRecord> {
            let n = self.merges.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_at.load(Ordering::SeqCst) {
                return Err(StorageError::ConnectionError("merge dropped".to_string()).into());
            }
            self.inner.merge(losing, winning)
        }
        fn unmerge(&self, losing: EntityId) -> CanonryResult<Option<MergeRecord>> {
            self.inner.unmerge(losing)
        }
        fn redirect_of(&self, id: EntityId) -> CanonryResult<Option<EntityId>> {
            self.inner.redirect_of(id)
        }
        fn redirected_into(&self, id: EntityId) -> CanonryResult<BTreeSet<EntityId>> {
            self.inner.redirected_into(id)
        }
        fn resolve_canonical(&self, id: EntityId) -> CanonryResult<EntityId> {
            self.inner.resolve_canonical(id)
        }
        fn entries_referencing(
            &self,
            id: EntityId,
        ) -> CanonryResult<BTreeSet<crate::entity::EntryId>> {
            self.inner.entries_referencing(id)
        }
    }

    fn flaky_stores(fail_at: usize) -> (Stores, Arc<FlakyCanonical>) {
        let flaky = Arc::new(FlakyCanonical::failing_merge(fail_at));
        let stores = Stores {
            canonical: Arc::clone(&flaky) as Arc<dyn CanonicalStore>,
            ..Stores::in_memory()
        };
        (stores, flaky)
    }

    fn merge_preview(
        engine: &FeedbackEngine,
        owner: OwnerId,
        merges: &[(EntityId, EntityId)],
    ) -> CasePreview {
        let actions: Vec<_> = merges
            .iter()
            .map(|(l, w)| json!({"action": "merge_entities", "losing_id": l, "winning_id": w}))
            .collect();
        engine
            .preview(
                owner,
                "me",
                Scope::User,
                &TemplateRequest::new("batch", json!({ "actions": actions })),
            )
            .unwrap()
    }

    #[test]
    fn test_failed_merge_leaves_version_and_jobs_untouched() {
        let (stores, flaky) = flaky_stores(1);
        let queue = Arc::new(RecordingQueue::default());
        let engine = engine(&stores, Arc::clone(&queue));
        let owner = OwnerId::new();
        let (a, b) = (entity(&stores, owner, "A"), entity(&stores, owner, "B"));

        let preview = merge_preview(&engine, owner, &[(a, b)]);
        let err = engine.apply(preview.case.clone()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(stores.cases.latest_version(owner).unwrap(), PolicyVersion::ZERO);
        assert!(stores.cases.get(preview.case.id).unwrap().is_none());
        assert!(stores.jobs.list_for_owner(owner).unwrap().is_empty());
        assert!(queue.enqueued.lock().unwrap().is_empty());
        assert_eq!(stores.canonical.resolve_canonical(a).unwrap(), a);

        // The same draft goes through once the store recovers.
        flaky.heal();
        let applied = engine.apply(preview.case).unwrap();
        assert_eq!(applied.case.applied_policy_version, Some(PolicyVersion::new(1)));
        assert_eq!(stores.canonical.resolve_canonical(a).unwrap(), b);
        assert_eq!(stores.jobs.list_for_owner(owner).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_batch_rolls_back_earlier_merges() {
        let (stores, _flaky) = flaky_stores(2);
        let engine = engine(&stores, Arc::new(RecordingQueue::default()));
        let owner = OwnerId::new();
        let (a, b) = (entity(&stores, owner, "A"), entity(&stores, owner, "B"));
        let (c, d) = (entity(&stores, owner, "C"), entity(&stores, owner, "D"));

        let preview = merge_preview(&engine, owner, &[(a, b), (c, d)]);
        engine.apply(preview.case).unwrap_err();

        assert_eq!(stores.canonical.resolve_canonical(a).unwrap(), a);
        assert_eq!(stores.canonical.resolve_canonical(c).unwrap(), c);
        assert_eq!(stores.canonical.redirect_of(a).unwrap(), None);
        assert_eq!(stores.cases.latest_version(owner).unwrap(), PolicyVersion::ZERO);
        assert!(engine.policy.current(owner).unwrap().redirects.is_empty());
    }

    #[test]
    fn test_preview_rejects_bad_payload() {
        let stores = Stores::in_memory();
        let engine = engine(&stores, Arc::new(RecordingQueue::default()));
        let err = engine
            .preview(
                OwnerId::new(),
                "me",
                Scope::Global,
                &TemplateRequest::new("set_alias", json!({"alias": "x"})),
            )
            .unwrap_err();
        assert!(err.is_validation());
    }
}
