//! Impact analysis for a set of policy actions.
//!
//! Computed before a case is applied: which entities move, how many rows a
//! merge rewrites, and which stored entries must be replayed. References to
//! entities that do not exist produce warnings, never errors.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entity::{CanonicalEntity, EntityId, EntryId, OwnerId};
use crate::error::CanonryResult;
use crate::extraction::EntryRecord;
use crate::normalize;
use crate::policy::matching::{force_link_matches, pattern_matches};
use crate::policy::{
    cached_regex, BlockScope, ForceLinkRule, MatchContext, PatternRule, PolicyAction,
    PolicyRuleset,
};
use crate::replay::ReplayReport;
use crate::storage::{CanonicalStore, EntryStore};

/// What applying a case would touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactSummary {
    pub impacted_entities: BTreeSet<EntityId>,
    /// Alias rows a merge moves.
    pub alias_rewrites: usize,
    /// Evidence rows a merge moves.
    pub evidence_rewrites: usize,
    /// Redirect chains whose head changes.
    pub redirects_to_recompute: usize,
    pub entries_to_replay: BTreeSet<EntryId>,
    /// Replay report under the candidate ruleset, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<ReplayReport>,
}

/// Impact of `actions` plus human-readable warnings.
///
/// `base` is the ruleset the actions will be folded over; removal actions
/// look up the rule they remove there.
///
/// # Errors
/// Store errors only.
pub fn analyze(
    canonical: &dyn CanonicalStore,
    entries: &dyn EntryStore,
    owner: OwnerId,
    actions: &[PolicyAction],
    base: &PolicyRuleset,
) -> CanonryResult<(ImpactSummary, Vec<String>)> {
    let mut scan = ImpactScan {
        canonical,
        owner,
        records: entries.list_for_owner(owner)?,
        entities: canonical.entities_for_owner(owner)?,
        summary: ImpactSummary::default(),
        warnings: Vec::new(),
    };
    for action in actions {
        scan.action(action, base)?;
    }
    Ok((scan.summary, scan.warnings))
}

struct ImpactScan<'a> {
    canonical: &'a dyn CanonicalStore,
    owner: OwnerId,
    records: Vec<EntryRecord>,
    entities: Vec<CanonicalEntity>,
    summary: ImpactSummary,
    warnings: Vec<String>,
}

impl ImpactScan<'_> {
    fn action(&mut self, action: &PolicyAction, base: &PolicyRuleset) -> CanonryResult<()> {
        match action {
            PolicyAction::MergeEntities {
                losing_id,
                winning_id,
            } => {
                let losing_ok = self.entity(*losing_id, "losing_id")?;
                let winning_ok = self.entity(*winning_id, "winning_id")?;
                if !(losing_ok && winning_ok) {
                    return Ok(());
                }
                self.summary.alias_rewrites += self.canonical.aliases(*losing_id)?.len();
                self.summary.evidence_rewrites += self.canonical.evidence(*losing_id)?.len();
                self.summary.redirects_to_recompute +=
                    1 + self.canonical.redirected_into(*losing_id)?.len();
                self.referencing(*losing_id)?;
                self.referencing(*winning_id)?;
            }
            PolicyAction::Unmerge { losing_id } => {
                if !self.entity(*losing_id, "losing_id")? {
                    return Ok(());
                }
                let Some(target) = self.canonical.redirect_of(*losing_id)? else {
                    self.warn(format!("entity {losing_id} is not merged; unmerge is a no-op"));
                    return Ok(());
                };
                self.summary.impacted_entities.insert(target);
                self.summary.redirects_to_recompute +=
                    1 + self.canonical.redirected_into(*losing_id)?.len();
                let head = self.canonical.resolve_canonical(target)?;
                self.referencing(*losing_id)?;
                self.referencing(head)?;
            }
            PolicyAction::SetAlias { alias, entity_id } => {
                if self.entity(*entity_id, "entity_id")? {
                    self.referencing(*entity_id)?;
                }
                let key = normalize::fold(alias);
                self.mentions(|ctx| ctx.key_matches(&key));
                self.named(&key, BlockScope::Any)?;
            }
            PolicyAction::ClearAlias { alias } => {
                let key = normalize::fold(alias);
                if let Some(prev) = base.forced_aliases.get(&key) {
                    self.summary.impacted_entities.insert(*prev);
                    self.referencing(*prev)?;
                }
                self.mentions(|ctx| ctx.key_matches(&key));
            }
            PolicyAction::BlockToken { token, scope }
            | PolicyAction::UnblockToken { token, scope } => {
                let key = normalize::fold(token);
                self.mentions(|ctx| scope.covers(ctx.kind) && ctx.key_matches(&key));
                self.named(&key, *scope)?;
            }
            PolicyAction::ForceLink { rule } => {
                if self.entity(rule.entity_id, "rule.entity_id")? {
                    self.referencing(rule.entity_id)?;
                }
                self.force_link(rule);
            }
            PolicyAction::RemoveForceLink { rule_id } => match base.force_links.get(rule_id) {
                Some(rule) => {
                    self.summary.impacted_entities.insert(rule.entity_id);
                    self.referencing(rule.entity_id)?;
                    self.force_link(rule);
                }
                None => self.warn(format!("force-link rule {rule_id} does not exist")),
            },
            PolicyAction::SetEntityType {
                entity_id, token, ..
            }
            | PolicyAction::ClearEntityType { entity_id, token } => {
                if let Some(id) = entity_id {
                    if self.entity(*id, "entity_id")? {
                        self.referencing(*id)?;
                    }
                }
                if let Some(token) = token {
                    let key = normalize::fold(token);
                    self.mentions(|ctx| ctx.key_matches(&key));
                    self.named(&key, BlockScope::Any)?;
                }
            }
            PolicyAction::PatternRule { rule } => self.pattern(rule)?,
            PolicyAction::RemovePatternRule { rule_id } => match base.pattern_rules.get(rule_id) {
                Some(rule) => self.pattern(rule)?,
                None => self.warn(format!("pattern rule {rule_id} does not exist")),
            },
        }
        Ok(())
    }

    /// Marks `id` impacted. Returns false (with a warning) if it is unknown.
    fn entity(&mut self, id: EntityId, field: &str) -> CanonryResult<bool> {
        match self.canonical.get(id)? {
            Some(entity) if entity.owner_id == self.owner => {
                self.summary.impacted_entities.insert(id);
                Ok(true)
            }
            Some(_) => {
                self.warn(format!("{field} {id} belongs to another owner"));
                Ok(false)
            }
            None => {
                self.warn(format!("{field} {id} does not exist"));
                Ok(false)
            }
        }
    }

    fn referencing(&mut self, id: EntityId) -> CanonryResult<()> {
        let entries = self.canonical.entries_referencing(id)?;
        self.summary.entries_to_replay.extend(entries);
        Ok(())
    }

    /// Adds every stored entry with a candidate satisfying `pred`.
    fn mentions(&mut self, pred: impl Fn(&MatchContext<'_>) -> bool) {
        for record in &self.records {
            let hit = record.candidates.iter().any(|c| {
                let ctx = MatchContext::new(&c.label, &c.snippet, &c.kind);
                pred(&ctx)
            });
            if hit {
                self.summary.entries_to_replay.insert(record.entry_id);
            }
        }
    }

    /// Existing entities whose name equals the folded `key`.
    fn named(&mut self, key: &str, scope: BlockScope) -> CanonryResult<()> {
        let hits: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| scope.covers(&e.kind))
            .filter(|e| e.normalized_name == key || normalize::fold(&e.canonical_name) == key)
            .map(|e| e.id)
            .collect();
        for id in hits {
            self.summary.impacted_entities.insert(id);
            self.referencing(id)?;
        }
        Ok(())
    }

    fn force_link(&mut self, rule: &ForceLinkRule) {
        self.mentions(|ctx| force_link_matches(rule, ctx));
    }

    fn pattern(&mut self, rule: &PatternRule) -> CanonryResult<()> {
        self.mentions(|ctx| pattern_matches(rule, ctx));
        let Ok(re) = cached_regex(&rule.pattern) else {
            return Ok(());
        };
        let hits: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| rule.kind.as_ref().map_or(true, |k| *k == e.kind))
            .filter(|e| re.is_match(&e.canonical_name))
            .map(|e| e.id)
            .collect();
        for id in hits {
            self.summary.impacted_entities.insert(id);
            self.referencing(id)?;
        }
        Ok(())
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}
