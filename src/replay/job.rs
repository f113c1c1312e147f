//! Replay job records and reports.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntryId, OwnerId};
use crate::feedback::CaseId;
use crate::policy::PolicyVersion;

uuid_id! {
    /// Unique identifier for a replay job.
    ReplayJobId
}

/// Job lifecycle: `Queued -> Running -> Done | Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Returns true once the job will not run again on its own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Counters collected while replaying entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub entries_processed: usize,
    /// Entries listed on the job but absent from the entry store.
    pub entries_missing: usize,
    pub candidates: usize,
    pub created: usize,
    pub matched: usize,
    pub forced: usize,
    pub blocked: usize,
    pub evidence_appended: usize,
    pub aliases_appended: usize,
}

impl ReplayReport {
    /// Adds `other` into `self`.
    pub fn absorb(&mut self, other: &Self) {
        self.entries_processed += other.entries_processed;
        self.entries_missing += other.entries_missing;
        self.candidates += other.candidates;
        self.created += other.created;
        self.matched += other.matched;
        self.forced += other.forced;
        self.blocked += other.blocked;
        self.evidence_appended += other.evidence_appended;
        self.aliases_appended += other.aliases_appended;
    }
}

/// Re-resolution of a set of entries under one policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayJob {
    pub id: ReplayJobId,
    pub owner_id: OwnerId,
    pub case_id: CaseId,
    /// Ruleset version captured when the job was created.
    pub policy_version: PolicyVersion,
    pub dry_run: bool,
    pub entries: BTreeSet<EntryId>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ReplayReport>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReplayJob {
    /// Creates a queued job.
    #[must_use]
    pub fn new(
        owner_id: OwnerId,
        case_id: CaseId,
        policy_version: PolicyVersion,
        entries: BTreeSet<EntryId>,
    ) -> Self {
        Self {
            id: ReplayJobId::new(),
            owner_id,
            case_id,
            policy_version,
            dry_run: false,
            entries,
            status: JobStatus::Queued,
            error: None,
            report: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Marks the job as a dry run.
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub(crate) fn start(&mut self) {
        self.status = JobStatus::Running;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub(crate) fn finish(&mut self, report: ReplayReport) {
        self.status = JobStatus::Done;
        self.report = Some(report);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>, partial: ReplayReport) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.report = Some(partial);
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let mut job = ReplayJob::new(
            OwnerId::new(),
            CaseId::new(),
            PolicyVersion::new(1),
            BTreeSet::new(),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.status.is_terminal());

        job.start();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        job.fail("boom", ReplayReport::default());
        assert!(job.status.is_terminal());
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.start();
        assert!(job.error.is_none());
        job.finish(ReplayReport {
            entries_processed: 2,
            ..ReplayReport::default()
        });
        assert_eq!(job.status, JobStatus::Done);
    }

    #[test]
    fn test_report_absorb() {
        let mut total = ReplayReport::default();
        let one = ReplayReport {
            candidates: 3,
            created: 1,
            matched: 2,
            ..ReplayReport::default()
        };
        total.absorb(&one);
        total.absorb(&one);
        assert_eq!(total.candidates, 6);
        assert_eq!(total.matched, 4);
    }
}
