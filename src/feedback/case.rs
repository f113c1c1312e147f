//! Feedback case records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::OwnerId;
use crate::policy::{PolicyAction, PolicyVersion};

uuid_id! {
    /// Unique identifier for a feedback case.
    CaseId
}

/// Lifecycle of a case: `Draft -> Applied -> Reverted`, never backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    #[default]
    Draft,
    Applied,
    Reverted,
}

impl CaseStatus {
    /// Returns true if moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Applied) | (Self::Applied, Self::Reverted)
        )
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Applied => write!(f, "applied"),
            Self::Reverted => write!(f, "reverted"),
        }
    }
}

/// Who a case was filed for. Versioning is always per owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    #[default]
    User,
}

/// A structured correction and its position in the owner's policy log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackCase {
    pub id: CaseId,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,
    pub actor: String,
    pub scope: Scope,
    pub template_id: String,
    pub payload: serde_json::Value,
    pub status: CaseStatus,
    /// Version the case was previewed against.
    pub base_policy_version: PolicyVersion,
    /// Set once the case is appended to the log.
    pub applied_policy_version: Option<PolicyVersion>,
    pub actions: Vec<PolicyAction>,
    /// The case this one undoes, for revert cases.
    pub reverts: Option<CaseId>,
    /// The revert case that undid this one.
    pub superseded_by: Option<CaseId>,
}

impl FeedbackCase {
    /// Creates a draft case.
    #[must_use]
    pub fn draft(
        owner_id: OwnerId,
        actor: impl Into<String>,
        scope: Scope,
        template_id: impl Into<String>,
        payload: serde_json::Value,
        actions: Vec<PolicyAction>,
        base_policy_version: PolicyVersion,
    ) -> Self {
        Self {
            id: CaseId::new(),
            owner_id,
            created_at: Utc::now(),
            actor: actor.into(),
            scope,
            template_id: template_id.into(),
            payload,
            status: CaseStatus::Draft,
            base_policy_version,
            applied_policy_version: None,
            actions,
            reverts: None,
            superseded_by: None,
        }
    }

    /// Marks the case applied at `version`.
    pub fn mark_applied(&mut self, version: PolicyVersion) {
        self.status = CaseStatus::Applied;
        self.applied_policy_version = Some(version);
    }

    #[must_use]
    pub const fn is_revert(&self) -> bool {
        self.reverts.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(CaseStatus::Draft.can_transition_to(CaseStatus::Applied));
        assert!(CaseStatus::Applied.can_transition_to(CaseStatus::Reverted));
        assert!(!CaseStatus::Reverted.can_transition_to(CaseStatus::Applied));
        assert!(!CaseStatus::Applied.can_transition_to(CaseStatus::Draft));
        assert!(!CaseStatus::Draft.can_transition_to(CaseStatus::Reverted));
    }

    #[test]
    fn test_mark_applied() {
        let mut case = FeedbackCase::draft(
            OwnerId::new(),
            "me",
            Scope::User,
            "batch",
            serde_json::json!({}),
            Vec::new(),
            PolicyVersion::ZERO,
        );
        assert_eq!(case.status, CaseStatus::Draft);
        case.mark_applied(PolicyVersion::new(1));
        assert_eq!(case.status, CaseStatus::Applied);
        assert_eq!(case.applied_policy_version, Some(PolicyVersion::new(1)));
        assert!(!case.is_revert());
    }
}
