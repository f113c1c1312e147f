//! Ruleset compilation from the applied-case log.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::entity::OwnerId;
use crate::error::{CanonryResult, ValidationError};
use crate::feedback::FeedbackCase;
use crate::storage::FeedbackCaseStore;

use super::ruleset::PolicyRuleset;
use super::PolicyVersion;

const RULESET_CACHE_MAX: usize = 4096;

/// Folds the applied cases of `owner` with version `<= upto`.
///
/// `cases` must be in version order. Versions are checked for contiguity
/// starting at 1.
///
/// # Errors
/// - [`ValidationError::NonContiguousLog`] if a version is skipped or repeated
/// - [`ValidationError::VersionAhead`] if the log ends before `upto`
pub fn compile(
    owner: OwnerId,
    cases: &[FeedbackCase],
    upto: PolicyVersion,
) -> Result<PolicyRuleset, ValidationError> {
    let mut ruleset = PolicyRuleset::empty(owner);
    for case in cases.iter().filter(|c| c.owner_id == owner) {
        let found = case.applied_policy_version.unwrap_or(PolicyVersion::ZERO);
        if found > upto {
            break;
        }
        let expected = ruleset.version.next();
        if found != expected {
            return Err(ValidationError::NonContiguousLog {
                owner,
                expected,
                found,
            });
        }
        fold_into(&mut ruleset, case);
    }
    if ruleset.version != upto {
        return Err(ValidationError::VersionAhead {
            requested: upto,
            latest: ruleset.version,
        });
    }
    Ok(ruleset)
}

/// Folds one case over `base`, producing the next version.
#[must_use]
pub fn fold_case(base: &PolicyRuleset, case: &FeedbackCase) -> PolicyRuleset {
    let mut next = base.clone();
    fold_into(&mut next, case);
    next
}

fn fold_into(ruleset: &mut PolicyRuleset, case: &FeedbackCase) {
    for action in &case.actions {
        ruleset.apply(action);
    }
    ruleset.version = case
        .applied_policy_version
        .unwrap_or_else(|| ruleset.version.next());
}

/// Compiled rulesets keyed by `(owner, version)`.
///
/// A version's ruleset never changes once its case is appended, so entries
/// only leave the cache through [`RulesetCache::invalidate`] or the size cap.
#[derive(Debug, Default)]
pub struct RulesetCache {
    entries: RwLock<HashMap<(OwnerId, PolicyVersion), Arc<PolicyRuleset>>>,
}

impl RulesetCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, owner: OwnerId, version: PolicyVersion) -> Option<Arc<PolicyRuleset>> {
        let guard = self.entries.read().ok()?;
        guard.get(&(owner, version)).cloned()
    }

    pub fn insert(&self, ruleset: Arc<PolicyRuleset>) {
        if let Ok(mut guard) = self.entries.write() {
            if guard.len() >= RULESET_CACHE_MAX {
                guard.clear();
            }
            guard.insert((ruleset.owner_id, ruleset.version), ruleset);
        }
    }

    /// Drops every cached version of `owner`.
    pub fn invalidate(&self, owner: OwnerId) {
        if let Ok(mut guard) = self.entries.write() {
            guard.retain(|(o, _), _| *o != owner);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serves rulesets by version, compiling from the case log on a miss.
pub struct PolicyProvider {
    cases: Arc<dyn FeedbackCaseStore>,
    cache: RulesetCache,
}

impl PolicyProvider {
    #[must_use]
    pub fn new(cases: Arc<dyn FeedbackCaseStore>) -> Self {
        Self {
            cases,
            cache: RulesetCache::new(),
        }
    }

    /// Latest applied version of `owner`.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn latest_version(&self, owner: OwnerId) -> CanonryResult<PolicyVersion> {
        self.cases.latest_version(owner)
    }

    /// Ruleset at the owner's latest version.
    ///
    /// # Errors
    /// Propagates store failures and log inconsistencies.
    pub fn current(&self, owner: OwnerId) -> CanonryResult<Arc<PolicyRuleset>> {
        let latest = self.cases.latest_version(owner)?;
        self.at_version(owner, latest)
    }

    /// Ruleset at exactly `version`.
    ///
    /// When version N-1 is cached only case N is folded; otherwise the log is
    /// compiled from scratch.
    ///
    /// # Errors
    /// - [`ValidationError::VersionAhead`] if `version` was never applied
    /// - [`ValidationError::NonContiguousLog`] if the stored log has gaps
    pub fn at_version(
        &self,
        owner: OwnerId,
        version: PolicyVersion,
    ) -> CanonryResult<Arc<PolicyRuleset>> {
        let latest = self.cases.latest_version(owner)?;
        if version > latest {
            return Err(ValidationError::VersionAhead {
                requested: version,
                latest,
            }
            .into());
        }
        if let Some(hit) = self.cache.get(owner, version) {
            return Ok(hit);
        }

        let ruleset = if version == PolicyVersion::ZERO {
            PolicyRuleset::empty(owner)
        } else {
            let cases = self.cases.list_applied(owner)?;
            match self.cache.get(owner, version.prev()) {
                Some(prev) => {
                    let case = cases
                        .iter()
                        .find(|c| c.applied_policy_version == Some(version))
                        .ok_or(ValidationError::NonContiguousLog {
                            owner,
                            expected: version,
                            found: prev.version,
                        })?;
                    fold_case(&prev, case)
                }
                None => compile(owner, &cases, version)?,
            }
        };

        tracing::debug!(
            owner = %owner,
            version = %ruleset.version,
            rules = ruleset.rule_count(),
            "compiled policy ruleset"
        );
        let ruleset = Arc::new(ruleset);
        self.cache.insert(Arc::clone(&ruleset));
        Ok(ruleset)
    }

    /// Drops cached rulesets of `owner`.
    pub fn invalidate(&self, owner: OwnerId) {
        self.cache.invalidate(owner);
    }

    #[must_use]
    pub fn cache(&self) -> &RulesetCache {
        &self.cache
    }
}

impl std::fmt::Debug for PolicyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyProvider")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{FeedbackCase, Scope};
    use crate::policy::action::{BlockScope, PolicyAction};
    use crate::storage::InMemoryFeedbackCaseStore;

    fn applied(owner: OwnerId, version: u64, token: &str) -> FeedbackCase {
        let mut case = FeedbackCase::draft(
            owner,
            "tester",
            Scope::User,
            "block_token",
            serde_json::json!({ "token": token }),
            vec![PolicyAction::BlockToken {
                token: token.to_string(),
                scope: BlockScope::Any,
            }],
            PolicyVersion::new(version - 1),
        );
        case.mark_applied(PolicyVersion::new(version));
        case
    }

    #[test]
    fn test_compile_contiguous() {
        let owner = OwnerId::new();
        let cases = vec![applied(owner, 1, "a"), applied(owner, 2, "b")];

        let v1 = compile(owner, &cases, PolicyVersion::new(1)).unwrap();
        assert_eq!(v1.version, PolicyVersion::new(1));
        assert_eq!(v1.rule_count(), 1);

        let v2 = compile(owner, &cases, PolicyVersion::new(2)).unwrap();
        assert_eq!(v2.rule_count(), 2);
        assert_eq!(fold_case(&v1, &cases[1]), v2);
    }

    #[test]
    fn test_compile_rejects_gap() {
        let owner = OwnerId::new();
        let cases = vec![applied(owner, 1, "a"), applied(owner, 3, "c")];
        let err = compile(owner, &cases, PolicyVersion::new(3)).unwrap_err();
        assert!(matches!(err, ValidationError::NonContiguousLog { .. }));
    }

    #[test]
    fn test_compile_short_log() {
        let owner = OwnerId::new();
        let cases = vec![applied(owner, 1, "a")];
        let err = compile(owner, &cases, PolicyVersion::new(2)).unwrap_err();
        assert!(matches!(err, ValidationError::VersionAhead { .. }));
    }

    #[test]
    fn test_provider_incremental_and_invalidate() {
        let owner = OwnerId::new();
        let store = Arc::new(InMemoryFeedbackCaseStore::new());
        store.append_applied(applied(owner, 1, "a")).unwrap();

        let provider = PolicyProvider::new(store.clone());
        let v1 = provider.current(owner).unwrap();
        assert_eq!(v1.version, PolicyVersion::new(1));

        store.append_applied(applied(owner, 2, "b")).unwrap();
        let v2 = provider.current(owner).unwrap();
        assert_eq!(v2.version, PolicyVersion::new(2));
        assert_eq!(provider.cache().len(), 2);

        let err = provider.at_version(owner, PolicyVersion::new(9)).unwrap_err();
        assert!(err.is_validation());

        provider.invalidate(owner);
        assert!(provider.cache().is_empty());
        let rebuilt = provider.current(owner).unwrap();
        assert_eq!(rebuilt.fingerprint().unwrap(), v2.fingerprint().unwrap());
    }
}
