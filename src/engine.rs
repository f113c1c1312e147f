//! The `Canonry` facade: wiring of stores, policy, resolver, feedback and
//! replay behind one handle.
//!
//! All writes for one owner are serialized through [`OwnerLocks`]: entry
//! ingestion, case application, and committed replay of a single entry
//! each run inside the owner's scope. Different owners proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::CanonryConfig;
use crate::entity::{CanonicalEntity, EntityId, EntryId, OwnerId};
use crate::error::CanonryResult;
use crate::extraction::{AnalysisResult, Candidate, EntryRecord};
use crate::feedback::{
    AppliedCase, CaseId, CasePreview, FeedbackCase, FeedbackEngine, Scope, TemplateRequest,
    TemplateShape,
};
use crate::policy::{PolicyProvider, PolicyRuleset, PolicyVersion};
use crate::replay::{ReplayExecutor, ReplayJob, ReplayJobId, ReplayQueue, ReplayScheduler};
use crate::resolver::{EntityResolver, EntryResolution, WriteMode};
use crate::storage::Stores;

/// Cooperative cancellation flag shared between a caller and a running
/// operation. Checked between candidates and between entries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-owner mutual exclusion for canonical-state writes.
#[derive(Debug, Default)]
pub struct OwnerLocks {
    locks: Mutex<HashMap<OwnerId, Arc<Mutex<()>>>>,
}

impl OwnerLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding `owner`'s lock.
    ///
    /// A panic inside a previous holder does not wedge the owner: the
    /// guarded value is `()`, so a poisoned lock is simply re-entered.
    /// The owner's entry is dropped again once nobody holds or waits on it.
    pub fn with_owner<T>(&self, owner: OwnerId, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.map();
            Arc::clone(locks.entry(owner).or_default())
        };
        let out = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Clones are only taken under the map lock, so the count is stable
        // here: the map's copy plus ours means no other holder or waiter.
        let mut locks = self.map();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&owner);
        }
        out
    }

    /// Owners with a lock entry, held or waited on.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.map().len()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<OwnerId, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entity resolution with a versioned feedback policy.
pub struct Canonry {
    stores: Stores,
    config: CanonryConfig,
    locks: Arc<OwnerLocks>,
    policy: Arc<PolicyProvider>,
    resolver: Arc<EntityResolver>,
    scheduler: Arc<ReplayScheduler>,
    feedback: FeedbackEngine,
}

impl std::fmt::Debug for Canonry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonry")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Canonry {
    /// Wires the engine over `stores` and starts the replay workers.
    ///
    /// # Errors
    /// `Validation(InvalidConfig)` if `config` is inconsistent.
    pub fn new(stores: Stores, config: CanonryConfig) -> CanonryResult<Self> {
        config.validate()?;

        let locks = Arc::new(OwnerLocks::new());
        let policy = Arc::new(PolicyProvider::new(Arc::clone(&stores.cases)));
        let resolver = Arc::new(
            EntityResolver::new(Arc::clone(&stores.canonical), config.resolver.clone())
                .with_hop_limit(config.redirect_hop_limit),
        );
        let executor = Arc::new(ReplayExecutor::new(
            Arc::clone(&resolver),
            Arc::clone(&policy),
            Arc::clone(&stores.entries),
            Arc::clone(&locks),
        ));
        let scheduler = Arc::new(ReplayScheduler::start(
            &config.replay,
            Arc::clone(&stores.jobs),
            Arc::clone(&executor),
        ));
        let queue: Arc<dyn ReplayQueue> = Arc::clone(&scheduler) as Arc<dyn ReplayQueue>;
        let feedback = FeedbackEngine::new(
            &stores,
            Arc::clone(&policy),
            executor,
            queue,
            Arc::clone(&locks),
            &config,
        );

        tracing::info!(
            workers = config.replay.workers,
            queue_capacity = config.replay.queue_capacity,
            hop_limit = config.redirect_hop_limit,
            "canonry started"
        );
        Ok(Self {
            stores,
            config,
            locks,
            policy,
            resolver,
            scheduler,
            feedback,
        })
    }

    /// Engine over fresh in-memory stores.
    ///
    /// # Errors
    /// As [`Canonry::new`].
    pub fn in_memory(config: CanonryConfig) -> CanonryResult<Self> {
        let stores = Stores::in_memory_with_hop_limit(config.redirect_hop_limit);
        Self::new(stores, config)
    }

    #[must_use]
    pub fn config(&self) -> &CanonryConfig {
        &self.config
    }

    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Adds or replaces a correction template.
    ///
    /// # Errors
    /// `Validation(UnknownTemplate)` if a single-action shape names an
    /// action that does not exist.
    pub fn register_template(
        &mut self,
        template_id: impl Into<String>,
        shape: TemplateShape,
    ) -> CanonryResult<()> {
        self.feedback.catalog_mut().register(template_id, shape)?;
        Ok(())
    }

    /// Records an entry's extraction and resolves its concepts under the
    /// owner's current policy.
    ///
    /// # Errors
    /// Store errors, or `Cancelled` if `cancel` fired mid-entry; candidates
    /// resolved before cancellation stay committed.
    pub fn ingest_entry(
        &self,
        owner: OwnerId,
        entry_id: EntryId,
        analysis: &AnalysisResult,
        cancel: &CancelToken,
    ) -> CanonryResult<EntryResolution> {
        self.ingest_candidates(owner, entry_id, analysis.candidates(entry_id), cancel)
    }

    /// Like [`Canonry::ingest_entry`] for already extracted candidates.
    ///
    /// # Errors
    /// As [`Canonry::ingest_entry`].
    pub fn ingest_candidates(
        &self,
        owner: OwnerId,
        entry_id: EntryId,
        candidates: Vec<Candidate>,
        cancel: &CancelToken,
    ) -> CanonryResult<EntryResolution> {
        self.locks.with_owner(owner, || -> CanonryResult<EntryResolution> {
            let record = EntryRecord::new(entry_id, owner, candidates);
            self.stores.entries.record(record.clone())?;
            let ruleset = self.policy.current(owner)?;
            let resolution = self.resolver.resolve_entry(
                owner,
                entry_id,
                &record.candidates,
                &ruleset,
                WriteMode::Commit,
                cancel,
            )?;
            tracing::info!(
                owner = %owner,
                entry = %entry_id,
                version = %ruleset.version,
                candidates = resolution.candidates.len(),
                "ingested entry"
            );
            Ok(resolution)
        })
    }

    /// Resolves candidates without writing anything.
    ///
    /// # Errors
    /// Store errors.
    pub fn resolve_dry_run(
        &self,
        owner: OwnerId,
        entry_id: EntryId,
        candidates: &[Candidate],
    ) -> CanonryResult<EntryResolution> {
        let ruleset = self.policy.current(owner)?;
        self.resolver.resolve_entry(
            owner,
            entry_id,
            candidates,
            &ruleset,
            WriteMode::DryRun,
            &CancelToken::new(),
        )
    }

    /// See [`FeedbackEngine::preview`].
    ///
    /// # Errors
    /// As [`FeedbackEngine::preview`].
    pub fn preview(
        &self,
        owner: OwnerId,
        actor: &str,
        scope: Scope,
        request: &TemplateRequest,
    ) -> CanonryResult<CasePreview> {
        self.feedback.preview(owner, actor, scope, request)
    }

    /// See [`FeedbackEngine::apply`].
    ///
    /// # Errors
    /// As [`FeedbackEngine::apply`].
    pub fn apply(&self, case: FeedbackCase) -> CanonryResult<AppliedCase> {
        self.feedback.apply(case)
    }

    /// See [`FeedbackEngine::revert`].
    ///
    /// # Errors
    /// As [`FeedbackEngine::revert`].
    pub fn revert(&self, case_id: CaseId, actor: &str) -> CanonryResult<AppliedCase> {
        self.feedback.revert(case_id, actor)
    }

    /// # Errors
    /// Store errors.
    pub fn case(&self, case_id: CaseId) -> CanonryResult<Option<FeedbackCase>> {
        self.feedback.get_case(case_id)
    }

    /// # Errors
    /// Store errors.
    pub fn policy_version(&self, owner: OwnerId) -> CanonryResult<PolicyVersion> {
        self.policy.latest_version(owner)
    }

    /// Ruleset at the owner's latest version.
    ///
    /// # Errors
    /// Store errors, or a validation error if the case log is corrupt.
    pub fn ruleset(&self, owner: OwnerId) -> CanonryResult<Arc<PolicyRuleset>> {
        self.policy.current(owner)
    }

    /// Ruleset at a past version.
    ///
    /// # Errors
    /// `Validation(VersionAhead)` if `version` was never applied.
    pub fn ruleset_at(
        &self,
        owner: OwnerId,
        version: PolicyVersion,
    ) -> CanonryResult<Arc<PolicyRuleset>> {
        self.policy.at_version(owner, version)
    }

    /// Head of `id`'s redirect chain.
    ///
    /// # Errors
    /// `Conflict(RedirectCycle)` if the chain loops or is too long.
    pub fn resolve_canonical(&self, id: EntityId) -> CanonryResult<EntityId> {
        self.stores.canonical.resolve_canonical(id)
    }

    /// # Errors
    /// Store errors.
    pub fn entity(&self, id: EntityId) -> CanonryResult<Option<CanonicalEntity>> {
        self.stores.canonical.get(id)
    }

    /// # Errors
    /// Store errors.
    pub fn job(&self, job_id: ReplayJobId) -> CanonryResult<Option<ReplayJob>> {
        self.stores.jobs.get(job_id)
    }

    /// Re-enqueues a stored job, e.g. one that failed.
    ///
    /// # Errors
    /// `NotFound` for an unknown job, or a replay queue error.
    pub fn retry_job(&self, job_id: ReplayJobId) -> CanonryResult<()> {
        self.scheduler.enqueue_replay(job_id)
    }

    /// Cancels a pending replay job; it ends up failed and can be retried
    /// with [`Canonry::retry_job`]. Returns false if the job is not pending.
    pub fn cancel_job(&self, job_id: ReplayJobId) -> bool {
        self.scheduler.cancel_job(job_id)
    }

    #[must_use]
    pub fn scheduler(&self) -> &ReplayScheduler {
        &self.scheduler
    }

    /// Blocks until every enqueued replay job has finished or `timeout`
    /// elapses. Returns true if the queue drained.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }
}
