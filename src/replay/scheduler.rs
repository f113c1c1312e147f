//! Background replay of stored entries after a policy change.
//!
//! A bounded crossbeam channel feeds a fixed pool of named worker threads.
//! Jobs are single-flight per owner: while one job of an owner is dispatched
//! or running, later jobs of that owner wait in the owner's FIFO and are run
//! by the same worker once the current one finishes.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::config::ReplayConfig;
use crate::engine::{CancelToken, OwnerLocks};
use crate::entity::{EntryId, OwnerId};
use crate::error::{CanonryError, CanonryResult, NotFoundError, ReplayError};
use crate::policy::{PolicyProvider, PolicyRuleset};
use crate::resolver::{EntityResolver, WriteMode};
use crate::storage::{EntryStore, ReplayJobStore};

use super::job::{JobStatus, ReplayJob, ReplayJobId, ReplayReport};

/// Accepts replay jobs for asynchronous execution.
///
/// Delivery is at-least-once; implementations tolerate duplicates.
pub trait ReplayQueue: Send + Sync {
    /// Schedules a stored job.
    ///
    /// # Errors
    /// `NotFound` if the job does not exist, or a [`ReplayError`] if the queue
    /// cannot accept work.
    fn enqueue_replay(&self, job_id: ReplayJobId) -> CanonryResult<()>;
}

/// Re-resolves stored entries under a given ruleset.
pub struct ReplayExecutor {
    resolver: Arc<EntityResolver>,
    policy: Arc<PolicyProvider>,
    entries: Arc<dyn EntryStore>,
    locks: Arc<OwnerLocks>,
}

impl std::fmt::Debug for ReplayExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayExecutor").finish_non_exhaustive()
    }
}

impl ReplayExecutor {
    #[must_use]
    pub fn new(
        resolver: Arc<EntityResolver>,
        policy: Arc<PolicyProvider>,
        entries: Arc<dyn EntryStore>,
        locks: Arc<OwnerLocks>,
    ) -> Self {
        Self {
            resolver,
            policy,
            entries,
            locks,
        }
    }

    /// Replays `entries` in id order, each inside the owner's write scope.
    ///
    /// Returns the counters accumulated so far together with the outcome,
    /// so a failed run still reports its partial progress.
    pub fn replay_entries(
        &self,
        owner: OwnerId,
        entries: &BTreeSet<EntryId>,
        ruleset: &PolicyRuleset,
        mode: WriteMode,
        cancel: &CancelToken,
    ) -> (ReplayReport, CanonryResult<()>) {
        let mut report = ReplayReport::default();
        for entry_id in entries {
            if cancel.is_cancelled() {
                return (report, Err(CanonryError::Cancelled));
            }
            let record = match self.entries.get(*entry_id) {
                Ok(Some(record)) if record.owner_id == owner => record,
                Ok(_) => {
                    report.entries_missing += 1;
                    continue;
                }
                Err(e) => return (report, Err(e)),
            };
            let resolved = match mode {
                WriteMode::Commit => self.locks.with_owner(owner, || {
                    self.resolver.resolve_entry(
                        owner,
                        *entry_id,
                        &record.candidates,
                        ruleset,
                        mode,
                        cancel,
                    )
                }),
                WriteMode::DryRun => self.resolver.resolve_entry(
                    owner,
                    *entry_id,
                    &record.candidates,
                    ruleset,
                    mode,
                    cancel,
                ),
            };
            match resolved {
                Ok(resolution) => report.absorb(&resolution.report()),
                Err(e) => return (report, Err(e)),
            }
        }
        (report, Ok(()))
    }

    /// Resolves `entries` under `ruleset` without writing anything.
    ///
    /// # Errors
    /// Store errors.
    pub fn dry_run_entries(
        &self,
        owner: OwnerId,
        entries: &BTreeSet<EntryId>,
        ruleset: &PolicyRuleset,
    ) -> CanonryResult<ReplayReport> {
        let (report, outcome) =
            self.replay_entries(owner, entries, ruleset, WriteMode::DryRun, &CancelToken::new());
        outcome.map(|()| report)
    }

    /// Runs one job under the ruleset version it captured.
    pub fn run_job(&self, job: &ReplayJob, cancel: &CancelToken) -> (ReplayReport, CanonryResult<()>) {
        let ruleset = match self.policy.at_version(job.owner_id, job.policy_version) {
            Ok(ruleset) => ruleset,
            Err(e) => return (ReplayReport::default(), Err(e)),
        };
        let mode = if job.dry_run {
            WriteMode::DryRun
        } else {
            WriteMode::Commit
        };
        self.replay_entries(job.owner_id, &job.entries, &ruleset, mode, cancel)
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// Jobs dispatched, waiting or running, with their owner.
    in_flight: HashMap<ReplayJobId, OwnerId>,
    /// Owners with a job dispatched to the pool or running.
    busy_owners: HashSet<OwnerId>,
    waiting: HashMap<OwnerId, VecDeque<ReplayJobId>>,
    /// One token per in-flight job; a retry gets a fresh one.
    tokens: HashMap<ReplayJobId, CancelToken>,
}

impl SchedulerState {
    fn admit(&mut self, job_id: ReplayJobId, owner: OwnerId) {
        self.in_flight.insert(job_id, owner);
        self.tokens.insert(job_id, CancelToken::new());
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    idle: Condvar,
    jobs: Arc<dyn ReplayJobStore>,
    executor: Arc<ReplayExecutor>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `first`, then every job that queued up behind it for the owner.
    fn drain_owner(&self, owner: OwnerId, first: ReplayJobId) {
        let mut next = Some(first);
        while let Some(job_id) = next {
            self.run(job_id);

            let mut state = self.lock();
            state.in_flight.remove(&job_id);
            state.tokens.remove(&job_id);
            next = state.waiting.get_mut(&owner).and_then(VecDeque::pop_front);
            if next.is_none() {
                state.waiting.remove(&owner);
                state.busy_owners.remove(&owner);
            }
            if state.in_flight.is_empty() {
                self.idle.notify_all();
            }
        }
    }

    fn run(&self, job_id: ReplayJobId) {
        let mut job = match self.jobs.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job = %job_id, "replay job vanished before running");
                return;
            }
            Err(e) => {
                tracing::warn!(job = %job_id, error = %e, "failed to load replay job");
                return;
            }
        };

        let cancel = self.lock().tokens.get(&job_id).cloned().unwrap_or_default();
        job.start();
        if let Err(e) = self.jobs.update(job.clone()) {
            tracing::warn!(job = %job_id, error = %e, "failed to mark replay job running");
        }
        let started = Instant::now();
        let (report, outcome) = self.executor.run_job(&job, &cancel);

        match outcome {
            Ok(()) => {
                tracing::info!(
                    job = %job.id,
                    owner = %job.owner_id,
                    case = %job.case_id,
                    version = %job.policy_version,
                    entries = report.entries_processed,
                    missing = report.entries_missing,
                    dry_run = job.dry_run,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "replay job finished"
                );
                job.finish(report);
            }
            Err(e) => {
                tracing::warn!(
                    job = %job.id,
                    owner = %job.owner_id,
                    case = %job.case_id,
                    version = %job.policy_version,
                    entries = report.entries_processed,
                    error = %e,
                    "replay job failed"
                );
                job.fail(e.to_string(), report);
            }
        }
        if let Err(e) = self.jobs.update(job) {
            tracing::warn!(job = %job_id, error = %e, "failed to record replay job outcome");
        }
    }
}

/// Worker pool executing replay jobs.
pub struct ReplayScheduler {
    shared: Arc<Shared>,
    tx: Option<Sender<(OwnerId, ReplayJobId)>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl std::fmt::Debug for ReplayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayScheduler")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl ReplayScheduler {
    /// Starts the worker threads.
    ///
    /// # Panics
    /// Panics if a worker thread cannot be spawned.
    #[must_use]
    pub fn start(
        config: &ReplayConfig,
        jobs: Arc<dyn ReplayJobStore>,
        executor: Arc<ReplayExecutor>,
    ) -> Self {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<(OwnerId, ReplayJobId)>(queue_capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            idle: Condvar::new(),
            jobs,
            executor,
        });

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<(OwnerId, ReplayJobId)> = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("canonry-replay-{idx}"))
                .spawn(move || {
                    while let Ok((owner, job_id)) = rx.recv() {
                        shared.drain_owner(owner, job_id);
                    }
                })
                .expect("failed to spawn canonry replay worker");
            handles.push(handle);
        }

        Self {
            shared,
            tx: Some(tx),
            workers: handles,
            queue_capacity,
        }
    }

    /// Cancels one pending job. A running job stops before its next entry
    /// and is marked failed; a waiting one fails as soon as it starts.
    /// Returns false if the job is not pending.
    pub fn cancel_job(&self, job_id: ReplayJobId) -> bool {
        let state = self.shared.lock();
        match state.tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(job = %job_id, "replay job cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every pending job of `owner` and returns how many there were.
    pub fn cancel_owner(&self, owner: OwnerId) -> usize {
        let state = self.shared.lock();
        let mut cancelled = 0;
        for (job_id, job_owner) in &state.in_flight {
            if *job_owner != owner {
                continue;
            }
            if let Some(token) = state.tokens.get(job_id) {
                token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(owner = %owner, jobs = cancelled, "replay jobs cancelled");
        }
        cancelled
    }

    /// Number of jobs dispatched, waiting or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Blocks until no job is pending or `timeout` elapses.
    /// Returns true if the scheduler went idle.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |s| !s.in_flight.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.in_flight.is_empty()
    }

    fn dispatch(&self, owner: OwnerId, job_id: ReplayJobId) -> CanonryResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(ReplayError::Disconnected.into());
        };
        match tx.try_send((owner, job_id)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReplayError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ReplayError::Disconnected.into()),
        }
    }
}

impl ReplayQueue for ReplayScheduler {
    fn enqueue_replay(&self, job_id: ReplayJobId) -> CanonryResult<()> {
        let mut job = self
            .shared
            .jobs
            .get(job_id)?
            .ok_or(NotFoundError::Job(job_id))?;
        let owner = job.owner_id;

        let mut state = self.shared.lock();
        if state.in_flight.contains_key(&job_id) {
            return Ok(());
        }
        match job.status {
            JobStatus::Running | JobStatus::Done => {
                tracing::debug!(job = %job_id, status = %job.status, "ignoring duplicate enqueue");
                return Ok(());
            }
            JobStatus::Failed => {
                job.status = JobStatus::Queued;
                job.error = None;
                self.shared.jobs.update(job)?;
            }
            JobStatus::Queued => {}
        }

        if state.busy_owners.contains(&owner) {
            state.waiting.entry(owner).or_default().push_back(job_id);
            state.admit(job_id, owner);
            tracing::debug!(job = %job_id, owner = %owner, "replay job waiting for owner");
            return Ok(());
        }

        self.dispatch(owner, job_id)?;
        state.busy_owners.insert(owner);
        state.admit(job_id, owner);
        tracing::debug!(job = %job_id, owner = %owner, "replay job dispatched");
        Ok(())
    }
}

impl Drop for ReplayScheduler {
    fn drop(&mut self) {
        // Close the channel: workers drain dispatched jobs, then exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::entity::EntityKind;
    use crate::extraction::{Candidate, EntryRecord};
    use crate::feedback::CaseId;
    use crate::policy::PolicyVersion;
    use crate::storage::{InMemoryReplayJobStore, Stores};

    /// Records every status a job is written with, in write order.
    struct RecordingJobStore {
        inner: InMemoryReplayJobStore,
        updates: Mutex<Vec<(ReplayJobId, JobStatus)>>,
    }

    impl ReplayJobStore for RecordingJobStore {
        fn insert(&self, job: ReplayJob) -> CanonryResult<()> {
            self.inner.insert(job)
        }
        fn get(&self, id: ReplayJobId) -> CanonryResult<Option<ReplayJob>> {
            self.inner.get(id)
        }
        fn update(&self, job: ReplayJob) -> CanonryResult<()> {
            self.updates.lock().unwrap().push((job.id, job.status));
            self.inner.update(job)
        }
        fn remove(&self, id: ReplayJobId) -> CanonryResult<Option<ReplayJob>> {
            self.inner.remove(id)
        }
        fn list_for_owner(&self, owner: OwnerId) -> CanonryResult<Vec<ReplayJob>> {
            self.inner.list_for_owner(owner)
        }
    }

    fn scheduler(stores: &Stores, workers: usize) -> ReplayScheduler {
        scheduler_with_locks(stores, workers).0
    }

    fn scheduler_with_locks(
        stores: &Stores,
        workers: usize,
    ) -> (ReplayScheduler, Arc<OwnerLocks>) {
        let locks = Arc::new(OwnerLocks::new());
        let resolver = Arc::new(EntityResolver::new(
            Arc::clone(&stores.canonical),
            ResolverConfig::default(),
        ));
        let policy = Arc::new(PolicyProvider::new(Arc::clone(&stores.cases)));
        let executor = Arc::new(ReplayExecutor::new(
            resolver,
            policy,
            Arc::clone(&stores.entries),
            Arc::clone(&locks),
        ));
        let sched = ReplayScheduler::start(
            &ReplayConfig {
                workers,
                queue_capacity: 16,
            },
            Arc::clone(&stores.jobs),
            executor,
        );
        (sched, locks)
    }

    fn entry(stores: &Stores, owner: OwnerId, label: &str) -> EntryId {
        let id = EntryId::new();
        stores
            .entries
            .record(EntryRecord::new(
                id,
                owner,
                vec![Candidate::new(label, EntityKind::Person, id)],
            ))
            .unwrap();
        id
    }

    fn job(stores: &Stores, owner: OwnerId, version: u64, entries: BTreeSet<EntryId>) -> ReplayJobId {
        let job = ReplayJob::new(owner, CaseId::new(), PolicyVersion::new(version), entries);
        let id = job.id;
        stores.jobs.insert(job).unwrap();
        id
    }

    #[test]
    fn test_jobs_run_to_done() {
        let stores = Stores::in_memory();
        let owner = OwnerId::new();
        let e1 = entry(&stores, owner, "Mario");
        let e2 = entry(&stores, owner, "mario");
        let sched = scheduler(&stores, 2);

        let first = job(&stores, owner, 0, BTreeSet::from([e1, e2]));
        let second = job(&stores, owner, 0, BTreeSet::from([e1, EntryId::new()]));
        sched.enqueue_replay(first).unwrap();
        sched.enqueue_replay(second).unwrap();
        // Duplicate enqueue is ignored.
        sched.enqueue_replay(first).unwrap();
        assert!(sched.wait_idle(Duration::from_secs(5)));

        let done = stores.jobs.get(first).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        let report = done.report.unwrap();
        assert_eq!(report.entries_processed, 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.matched, 1);

        let second = stores.jobs.get(second).unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Done);
        assert_eq!(second.report.unwrap().entries_missing, 1);
        assert_eq!(stores.canonical.entities_for_owner(owner).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_job_records_error_and_can_retry() {
        let stores = Stores::in_memory();
        let owner = OwnerId::new();
        let sched = scheduler(&stores, 1);

        // Version 3 was never applied, so the ruleset cannot be built.
        let id = job(&stores, owner, 3, BTreeSet::new());
        sched.enqueue_replay(id).unwrap();
        assert!(sched.wait_idle(Duration::from_secs(5)));
        let failed = stores.jobs.get(id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("ahead"));

        sched.enqueue_replay(id).unwrap();
        assert!(sched.wait_idle(Duration::from_secs(5)));
        assert_eq!(stores.jobs.get(id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_cancelled_job_fails_and_retry_runs() {
        let stores = Stores::in_memory();
        let owner = OwnerId::new();
        let e1 = entry(&stores, owner, "Anna");
        let (sched, locks) = scheduler_with_locks(&stores, 1);

        let id = job(&stores, owner, 0, BTreeSet::from([e1]));
        // Holding the owner lock keeps the worker from resolving the entry
        // before the cancel lands.
        locks.with_owner(owner, || {
            sched.enqueue_replay(id).unwrap();
            assert!(sched.cancel_job(id));
        });
        assert!(sched.wait_idle(Duration::from_secs(5)));
        let failed = stores.jobs.get(id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().to_lowercase().contains("cancelled"));
        assert!(stores.canonical.entities_for_owner(owner).unwrap().is_empty());
        assert!(!sched.cancel_job(id));

        // The retry gets a fresh token.
        sched.enqueue_replay(id).unwrap();
        assert!(sched.wait_idle(Duration::from_secs(5)));
        let done = stores.jobs.get(id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(stores.canonical.entities_for_owner(owner).unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_owner_spares_other_owners() {
        let stores = Stores::in_memory();
        let (owner, other) = (OwnerId::new(), OwnerId::new());
        let mine = entry(&stores, owner, "Anna");
        let theirs = entry(&stores, other, "Bruno");
        let (sched, locks) = scheduler_with_locks(&stores, 2);

        let first = job(&stores, owner, 0, BTreeSet::from([mine]));
        let second = job(&stores, owner, 0, BTreeSet::from([mine]));
        let kept = job(&stores, other, 0, BTreeSet::from([theirs]));
        locks.with_owner(owner, || {
            sched.enqueue_replay(first).unwrap();
            sched.enqueue_replay(second).unwrap();
            sched.enqueue_replay(kept).unwrap();
            assert_eq!(sched.cancel_owner(owner), 2);
        });
        assert!(sched.wait_idle(Duration::from_secs(5)));

        for id in [first, second] {
            assert_eq!(stores.jobs.get(id).unwrap().unwrap().status, JobStatus::Failed);
        }
        assert_eq!(stores.jobs.get(kept).unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(sched.cancel_owner(owner), 0);
    }

    #[test]
    fn test_owner_jobs_run_one_at_a_time_in_order() {
        let recording = Arc::new(RecordingJobStore {
            inner: InMemoryReplayJobStore::new(),
            updates: Mutex::new(Vec::new()),
        });
        let stores = Stores {
            jobs: Arc::clone(&recording) as Arc<dyn ReplayJobStore>,
            ..Stores::in_memory()
        };
        let (owner, other) = (OwnerId::new(), OwnerId::new());
        let (sched, locks) = scheduler_with_locks(&stores, 3);

        let mine: Vec<ReplayJobId> = (0..5)
            .map(|i| {
                let e = entry(&stores, owner, &format!("Person {i}"));
                job(&stores, owner, 0, BTreeSet::from([e]))
            })
            .collect();
        let theirs: Vec<ReplayJobId> = (0..2)
            .map(|i| {
                let e = entry(&stores, other, &format!("Other {i}"));
                job(&stores, other, 0, BTreeSet::from([e]))
            })
            .collect();

        // With the owner locked, the first job blocks mid-run and the rest
        // pile up behind it while idle workers are available.
        locks.with_owner(owner, || {
            for (i, id) in mine.iter().enumerate() {
                sched.enqueue_replay(*id).unwrap();
                if let Some(theirs) = theirs.get(i) {
                    sched.enqueue_replay(*theirs).unwrap();
                }
            }
            assert!(sched.pending() >= mine.len());
        });
        assert!(sched.wait_idle(Duration::from_secs(10)));

        let events: Vec<(ReplayJobId, JobStatus)> = recording
            .updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| mine.contains(id))
            .copied()
            .collect();
        let expected: Vec<(ReplayJobId, JobStatus)> = mine
            .iter()
            .flat_map(|id| [(*id, JobStatus::Running), (*id, JobStatus::Done)])
            .collect();
        assert_eq!(events, expected);
        for id in &theirs {
            assert_eq!(stores.jobs.get(*id).unwrap().unwrap().status, JobStatus::Done);
        }
    }

    #[test]
    fn test_unknown_job() {
        let stores = Stores::in_memory();
        let sched = scheduler(&stores, 1);
        let err = sched.enqueue_replay(ReplayJobId::new()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(sched.pending(), 0);
    }
}
