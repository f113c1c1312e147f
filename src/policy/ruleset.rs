//! Compiled policy ruleset.
//!
//! A ruleset is an immutable snapshot: version N is the fold of the first N
//! applied cases. Every collection is ordered so the serialized form (and
//! its fingerprint) is byte-identical across rebuilds of the same log.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityKind, OwnerId};
use crate::normalize;
use crate::redirect::{self, RedirectError};

use super::action::{
    BlockScope, ForceLinkMatcher, ForceLinkRule, PatternEffect, PatternRule, PolicyAction, RuleId,
};
use super::matching::{force_link_matches, pattern_matches, MatchContext};
use super::PolicyVersion;

/// Immutable set of corrective rules for one owner at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRuleset {
    pub owner_id: OwnerId,
    pub version: PolicyVersion,
    pub blocked_tokens: BTreeMap<BlockScope, BTreeSet<String>>,
    pub token_type_overrides: BTreeMap<String, EntityKind>,
    pub forced_aliases: BTreeMap<String, EntityId>,
    pub force_links: BTreeMap<RuleId, ForceLinkRule>,
    pub entity_type_overrides: BTreeMap<EntityId, EntityKind>,
    pub redirects: BTreeMap<EntityId, EntityId>,
    pub pattern_rules: BTreeMap<RuleId, PatternRule>,
    /// Number of actions folded so far; stamps rule sequences.
    pub actions_folded: u64,
}

impl PolicyRuleset {
    /// The version-0 ruleset: no rules at all.
    #[must_use]
    pub fn empty(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            version: PolicyVersion::ZERO,
            blocked_tokens: BTreeMap::new(),
            token_type_overrides: BTreeMap::new(),
            forced_aliases: BTreeMap::new(),
            force_links: BTreeMap::new(),
            entity_type_overrides: BTreeMap::new(),
            redirects: BTreeMap::new(),
            pattern_rules: BTreeMap::new(),
            actions_folded: 0,
        }
    }

    /// Folds one action into the ruleset. Total: unknown targets are no-ops.
    pub fn apply(&mut self, action: &PolicyAction) {
        self.actions_folded += 1;
        let sequence = self.actions_folded;
        match action {
            PolicyAction::BlockToken { token, scope } => {
                self.blocked_tokens
                    .entry(*scope)
                    .or_default()
                    .insert(normalize::fold(token));
            }
            PolicyAction::UnblockToken { token, scope } => {
                if let Some(set) = self.blocked_tokens.get_mut(scope) {
                    set.remove(&normalize::fold(token));
                    if set.is_empty() {
                        self.blocked_tokens.remove(scope);
                    }
                }
            }
            PolicyAction::SetAlias { alias, entity_id } => {
                self.forced_aliases.insert(normalize::fold(alias), *entity_id);
            }
            PolicyAction::ClearAlias { alias } => {
                self.forced_aliases.remove(&normalize::fold(alias));
            }
            PolicyAction::ForceLink { rule } => {
                let mut rule = rule.clone();
                rule.matcher = fold_matcher(&rule.matcher);
                rule.sequence = sequence;
                self.force_links.insert(rule.rule_id, rule);
            }
            PolicyAction::RemoveForceLink { rule_id } => {
                self.force_links.remove(rule_id);
            }
            PolicyAction::SetEntityType {
                entity_id,
                token,
                kind,
            } => {
                if let Some(id) = entity_id {
                    self.entity_type_overrides.insert(*id, kind.clone());
                } else if let Some(token) = token {
                    self.token_type_overrides
                        .insert(normalize::fold(token), kind.clone());
                }
            }
            PolicyAction::ClearEntityType { entity_id, token } => {
                if let Some(id) = entity_id {
                    self.entity_type_overrides.remove(id);
                } else if let Some(token) = token {
                    self.token_type_overrides.remove(&normalize::fold(token));
                }
            }
            PolicyAction::MergeEntities {
                losing_id,
                winning_id,
            } => {
                self.redirects.insert(*losing_id, *winning_id);
            }
            PolicyAction::Unmerge { losing_id } => {
                self.redirects.remove(losing_id);
            }
            PolicyAction::PatternRule { rule } => {
                let mut rule = rule.clone();
                rule.sequence = sequence;
                self.pattern_rules.insert(rule.rule_id, rule);
            }
            PolicyAction::RemovePatternRule { rule_id } => {
                self.pattern_rules.remove(rule_id);
            }
        }
    }

    /// Returns true if a blocked token covers the mention.
    #[must_use]
    pub fn is_blocked(&self, ctx: &MatchContext<'_>) -> bool {
        self.blocked_tokens
            .iter()
            .filter(|(scope, _)| scope.covers(ctx.kind))
            .any(|(_, tokens)| ctx.keys().iter().any(|k| tokens.contains(*k)))
    }

    /// Best force-link rule for the mention: most specific, then most recent.
    #[must_use]
    pub fn best_force_link(&self, ctx: &MatchContext<'_>) -> Option<&ForceLinkRule> {
        self.force_links
            .values()
            .filter(|rule| force_link_matches(rule, ctx))
            .max_by_key(|rule| (rule.matcher.specificity(), rule.sequence))
    }

    /// First blocking pattern rule that matches, in fold order.
    #[must_use]
    pub fn blocking_pattern(&self, ctx: &MatchContext<'_>) -> Option<&PatternRule> {
        self.patterns_in_order()
            .into_iter()
            .filter(|rule| rule.effect == PatternEffect::Block)
            .find(|rule| pattern_matches(rule, ctx))
    }

    /// Kind override for the mention: token overrides, then the most recent
    /// kind-setting pattern rule.
    #[must_use]
    pub fn kind_override(&self, ctx: &MatchContext<'_>) -> Option<EntityKind> {
        if let Some(kind) = ctx
            .keys()
            .iter()
            .find_map(|k| self.token_type_overrides.get(*k))
        {
            return Some(kind.clone());
        }
        self.patterns_in_order()
            .into_iter()
            .rev()
            .find_map(|rule| match &rule.effect {
                PatternEffect::SetKind { target_kind } if pattern_matches(rule, ctx) => {
                    Some(target_kind.clone())
                }
                _ => None,
            })
    }

    /// Entity pinned by a forced alias for the mention.
    #[must_use]
    pub fn forced_alias(&self, ctx: &MatchContext<'_>) -> Option<EntityId> {
        ctx.keys()
            .iter()
            .find_map(|k| self.forced_aliases.get(*k).copied())
    }

    /// Kind override pinned on an entity.
    #[must_use]
    pub fn entity_kind(&self, id: EntityId) -> Option<&EntityKind> {
        self.entity_type_overrides.get(&id)
    }

    /// Follows redirect overrides from `id`.
    ///
    /// # Errors
    /// Returns [`RedirectError`] if the overrides form a cycle.
    pub fn resolve_redirect(&self, id: EntityId, hop_limit: usize) -> Result<EntityId, RedirectError> {
        redirect::follow(id, hop_limit, |cur| self.redirects.get(&cur).copied())
    }

    /// Canonical serialized form.
    ///
    /// # Errors
    /// Returns the serializer's error if a rule cannot be encoded.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// blake3 fingerprint of the canonical form, hex encoded.
    ///
    /// # Errors
    /// As [`PolicyRuleset::to_canonical_bytes`].
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = self.to_canonical_bytes()?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Total number of rules of every kind.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.blocked_tokens.values().map(BTreeSet::len).sum::<usize>()
            + self.token_type_overrides.len()
            + self.forced_aliases.len()
            + self.force_links.len()
            + self.entity_type_overrides.len()
            + self.redirects.len()
            + self.pattern_rules.len()
    }

    fn patterns_in_order(&self) -> Vec<&PatternRule> {
        let mut rules: Vec<&PatternRule> = self.pattern_rules.values().collect();
        rules.sort_by_key(|r| r.sequence);
        rules
    }
}

fn fold_matcher(matcher: &ForceLinkMatcher) -> ForceLinkMatcher {
    match matcher {
        ForceLinkMatcher::Exact { text } => ForceLinkMatcher::Exact {
            text: normalize::fold(text),
        },
        ForceLinkMatcher::NearTokens { tokens, window } => ForceLinkMatcher::NearTokens {
            tokens: tokens.iter().flat_map(|t| normalize::tokens(t)).collect(),
            window: *window,
        },
        ForceLinkMatcher::Generic { pattern } => ForceLinkMatcher::Generic {
            pattern: pattern.clone(),
        },
    }
}
