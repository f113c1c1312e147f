//! Policy actions, compiled rulesets and the version-keyed compiler.
//!
//! Each owner has an append-only log of applied feedback cases. Policy
//! version N is the deterministic fold of the first N cases' actions over
//! the empty ruleset.

pub mod action;
pub mod compiler;
pub mod matching;
pub mod ruleset;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use action::{
    BlockScope, ForceLinkMatcher, ForceLinkRule, PatternEffect, PatternRule, PolicyAction, RuleId,
};
pub use compiler::{compile, fold_case, PolicyProvider, RulesetCache};
pub use matching::{cached_regex, MatchContext};
pub use ruleset::PolicyRuleset;

/// Monotonic per-owner policy version. `0` is the empty ruleset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PolicyVersion(u64);

impl PolicyVersion {
    /// Version with no applied cases.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version an appended case will receive.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The preceding version, saturating at zero.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_arithmetic() {
        let v = PolicyVersion::ZERO.next().next();
        assert_eq!(v.get(), 2);
        assert_eq!(v.prev(), PolicyVersion::new(1));
        assert_eq!(PolicyVersion::ZERO.prev(), PolicyVersion::ZERO);
        assert_eq!(v.to_string(), "v2");
        assert_eq!(serde_json::to_string(&v).unwrap(), "2");
    }
}
