//! Entity resolution.
//!
//! Maps each extracted candidate to a canonical entity under one policy
//! ruleset. Decision order per candidate:
//!
//! 1. force-link rules (most specific, then most recent)
//! 2. blocked tokens and blocking pattern rules
//! 3. kind overrides (token overrides, then kind-setting patterns)
//! 4. forced aliases
//! 5. anchor lookup on the normalized name
//! 6. alias lookup on the normalized name
//! 7. create a new entity
//!
//! Every id that comes out of a lookup or rule is passed through the
//! ruleset's redirects and then [`CanonicalStore::resolve_canonical`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ResolverConfig;
use crate::engine::CancelToken;
use crate::entity::{
    AliasType, CanonicalEntity, EntityAlias, EntityEvidence, EntityId, EntityKind, EntryId,
    EvidenceKey, EvidenceType, OwnerId,
};
use crate::error::{CanonryError, CanonryResult};
use crate::extraction::Candidate;
use crate::normalize;
use crate::policy::{MatchContext, PolicyRuleset, PolicyVersion, RuleId};
use crate::redirect::DEFAULT_HOP_LIMIT;
use crate::replay::ReplayReport;
use crate::storage::CanonicalStore;

/// Evidence property recorded for mentions coming from extraction concepts.
pub const CONCEPTS_PROPERTY: &str = "concepts";

/// Why a candidate produced no entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockReason {
    /// A blocked token covered the label.
    Token { token: String },
    /// A blocking pattern rule matched.
    Pattern { rule_id: RuleId },
    /// The label normalizes to nothing.
    EmptyLabel,
    /// The label exceeds the configured maximum length.
    LabelTooLong { max_length: usize },
}

/// Which lookup found an existing entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchVia {
    ForcedAlias,
    Anchor,
    Alias,
}

/// Outcome for one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Blocked { reason: BlockReason },
    ForcedLink { entity_id: EntityId, rule_id: RuleId },
    MatchedExisting { entity_id: EntityId, via: MatchVia },
    Created { entity_id: EntityId },
}

impl Resolution {
    /// The resolved entity, if any.
    #[must_use]
    pub const fn entity_id(&self) -> Option<EntityId> {
        match self {
            Self::Blocked { .. } => None,
            Self::ForcedLink { entity_id, .. }
            | Self::MatchedExisting { entity_id, .. }
            | Self::Created { entity_id } => Some(*entity_id),
        }
    }
}

/// A candidate with its outcome and what it wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCandidate {
    pub label: String,
    /// Kind after overrides.
    pub kind: EntityKind,
    pub resolution: Resolution,
    pub evidence_appended: bool,
    pub alias_appended: bool,
}

/// Outcomes for one entry, in extraction order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryResolution {
    pub owner_id: OwnerId,
    pub entry_id: EntryId,
    pub policy_version: PolicyVersion,
    pub dry_run: bool,
    pub candidates: Vec<ResolvedCandidate>,
}

impl EntryResolution {
    /// Resolved entity ids, blocked candidates skipped.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.candidates
            .iter()
            .filter_map(|c| c.resolution.entity_id())
            .collect()
    }

    /// Counters for this entry.
    #[must_use]
    pub fn report(&self) -> ReplayReport {
        let mut report = ReplayReport {
            entries_processed: 1,
            candidates: self.candidates.len(),
            ..ReplayReport::default()
        };
        for c in &self.candidates {
            match c.resolution {
                Resolution::Blocked { .. } => report.blocked += 1,
                Resolution::ForcedLink { .. } => report.forced += 1,
                Resolution::MatchedExisting { .. } => report.matched += 1,
                Resolution::Created { .. } => report.created += 1,
            }
            report.evidence_appended += usize::from(c.evidence_appended);
            report.aliases_appended += usize::from(c.alias_appended);
        }
        report
    }
}

/// Whether resolution writes to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Commit,
    /// Plan writes against an overlay that is dropped with the entry.
    DryRun,
}

/// Writes planned during a dry run, visible to later candidates of the
/// same entry.
#[derive(Debug, Default)]
struct PendingWrites {
    entities: HashMap<EntityId, CanonicalEntity>,
    anchors: HashMap<(OwnerId, String), EntityId>,
    aliases: HashMap<(OwnerId, EntityKind, String), Vec<EntityId>>,
    alias_pairs: HashSet<(EntityId, String)>,
    evidence_keys: HashSet<EvidenceKey>,
}

/// Store access for one entry, either direct or through an overlay.
struct EntryWriter<'a> {
    store: &'a dyn CanonicalStore,
    pending: Option<PendingWrites>,
}

impl<'a> EntryWriter<'a> {
    fn new(store: &'a dyn CanonicalStore, mode: WriteMode) -> Self {
        let pending = match mode {
            WriteMode::Commit => None,
            WriteMode::DryRun => Some(PendingWrites::default()),
        };
        Self { store, pending }
    }

    fn get(&self, id: EntityId) -> CanonryResult<Option<CanonicalEntity>> {
        if let Some(entity) = self.pending.as_ref().and_then(|p| p.entities.get(&id)) {
            return Ok(Some(entity.clone()));
        }
        self.store.get(id)
    }

    fn find_by_anchor(
        &self,
        owner: OwnerId,
        kind: &EntityKind,
        normalized: &str,
    ) -> CanonryResult<Option<EntityId>> {
        if let Some(found) = self.store.find_by_anchor(owner, kind, normalized)? {
            return Ok(Some(found.id));
        }
        Ok(self.pending.as_ref().and_then(|p| {
            p.anchors
                .get(&(owner, normalize::anchor_key(kind, normalized)))
                .copied()
        }))
    }

    fn find_by_alias(
        &self,
        owner: OwnerId,
        kind: &EntityKind,
        normalized: &str,
    ) -> CanonryResult<Option<EntityId>> {
        if let Some(first) = self
            .store
            .find_by_alias(owner, kind, normalized)?
            .into_iter()
            .next()
        {
            return Ok(Some(first));
        }
        Ok(self.pending.as_ref().and_then(|p| {
            p.aliases
                .get(&(owner, kind.clone(), normalized.to_string()))
                .and_then(|ids| ids.first().copied())
        }))
    }

    fn create(&mut self, entity: CanonicalEntity) -> CanonryResult<()> {
        match self.pending.as_mut() {
            None => self.store.create(entity),
            Some(p) => {
                p.anchors
                    .insert((entity.owner_id, entity.anchor_key.clone()), entity.id);
                p.entities.insert(entity.id, entity);
                Ok(())
            }
        }
    }

    fn add_alias(&mut self, alias: EntityAlias) -> CanonryResult<bool> {
        let Some(p) = self.pending.as_mut() else {
            return self.store.add_alias(alias);
        };
        let pair = (alias.entity_id, alias.normalized_alias.clone());
        if p.alias_pairs.contains(&pair) {
            return Ok(false);
        }
        let owning = match p.entities.get(&alias.entity_id) {
            Some(e) => Some((e.owner_id, e.kind.clone())),
            None => {
                let exists = self
                    .store
                    .aliases(alias.entity_id)?
                    .iter()
                    .any(|a| a.normalized_alias == alias.normalized_alias);
                if exists {
                    return Ok(false);
                }
                self.store
                    .get(alias.entity_id)?
                    .map(|e| (e.owner_id, e.kind))
            }
        };
        if let Some((owner, kind)) = owning {
            p.aliases
                .entry((owner, kind, alias.normalized_alias.clone()))
                .or_default()
                .push(alias.entity_id);
        }
        p.alias_pairs.insert(pair);
        Ok(true)
    }

    fn add_evidence(&mut self, evidence: EntityEvidence) -> CanonryResult<bool> {
        let Some(p) = self.pending.as_mut() else {
            return self.store.add_evidence(evidence);
        };
        let key = evidence.key();
        if p.evidence_keys.contains(&key) {
            return Ok(false);
        }
        if !p.entities.contains_key(&evidence.entity_id)
            && self
                .store
                .evidence(evidence.entity_id)?
                .iter()
                .any(|e| e.key() == key)
        {
            return Ok(false);
        }
        p.evidence_keys.insert(key);
        Ok(true)
    }

    fn touch(&self, id: EntityId) -> CanonryResult<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        self.store.touch(id, Utc::now())
    }
}

/// Resolves candidates against a canonical store.
pub struct EntityResolver {
    store: Arc<dyn CanonicalStore>,
    config: ResolverConfig,
    hop_limit: usize,
}

impl std::fmt::Debug for EntityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityResolver")
            .field("config", &self.config)
            .field("hop_limit", &self.hop_limit)
            .finish_non_exhaustive()
    }
}

impl EntityResolver {
    #[must_use]
    pub fn new(store: Arc<dyn CanonicalStore>, config: ResolverConfig) -> Self {
        Self {
            store,
            config,
            hop_limit: DEFAULT_HOP_LIMIT,
        }
    }

    /// Sets the hop limit used for ruleset redirects.
    #[must_use]
    pub fn with_hop_limit(mut self, hop_limit: usize) -> Self {
        self.hop_limit = hop_limit.max(1);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CanonicalStore> {
        &self.store
    }

    /// Resolves the candidates of one entry in order.
    ///
    /// The caller holds the owner's write scope. `cancel` is checked before
    /// each candidate; on cancellation the store keeps every candidate
    /// completed so far.
    ///
    /// # Errors
    /// Store errors, or [`CanonryError::Cancelled`].
    pub fn resolve_entry(
        &self,
        owner: OwnerId,
        entry_id: EntryId,
        candidates: &[Candidate],
        ruleset: &PolicyRuleset,
        mode: WriteMode,
        cancel: &CancelToken,
    ) -> CanonryResult<EntryResolution> {
        let mut writer = EntryWriter::new(self.store.as_ref(), mode);
        let mut resolved = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if cancel.is_cancelled() {
                tracing::debug!(owner = %owner, entry = %entry_id, "resolution cancelled");
                return Err(CanonryError::Cancelled);
            }
            let outcome = self.resolve_one(owner, entry_id, candidate, ruleset, &mut writer)?;
            tracing::debug!(
                owner = %owner,
                entry = %entry_id,
                version = %ruleset.version,
                label = %candidate.label,
                kind = %outcome.kind,
                resolution = ?outcome.resolution,
                "resolved candidate"
            );
            resolved.push(outcome);
        }

        Ok(EntryResolution {
            owner_id: owner,
            entry_id,
            policy_version: ruleset.version,
            dry_run: mode == WriteMode::DryRun,
            candidates: resolved,
        })
    }

    fn resolve_one(
        &self,
        owner: OwnerId,
        entry_id: EntryId,
        candidate: &Candidate,
        ruleset: &PolicyRuleset,
        writer: &mut EntryWriter<'_>,
    ) -> CanonryResult<ResolvedCandidate> {
        let blocked = |kind: &EntityKind, reason| ResolvedCandidate {
            label: candidate.label.clone(),
            kind: kind.clone(),
            resolution: Resolution::Blocked { reason },
            evidence_appended: false,
            alias_appended: false,
        };

        if candidate.label.chars().count() > self.config.max_label_len {
            return Ok(blocked(
                &candidate.kind,
                BlockReason::LabelTooLong {
                    max_length: self.config.max_label_len,
                },
            ));
        }

        let ctx = MatchContext::new(&candidate.label, &candidate.snippet, &candidate.kind);

        if let Some(rule) = ruleset.best_force_link(&ctx) {
            let target = self.canonical(ruleset, rule.entity_id)?;
            match writer.get(target)? {
                Some(entity) => {
                    let evidence = EntityEvidence::new(
                        target,
                        entry_id,
                        EvidenceType::ForcedLink,
                        candidate.snippet.clone(),
                    )
                    .with_property(CONCEPTS_PROPERTY);
                    let evidence_appended = writer.add_evidence(evidence)?;
                    if evidence_appended {
                        writer.touch(target)?;
                    }
                    return Ok(ResolvedCandidate {
                        label: candidate.label.clone(),
                        kind: effective_entity_kind(ruleset, &entity),
                        resolution: Resolution::ForcedLink {
                            entity_id: target,
                            rule_id: rule.rule_id,
                        },
                        evidence_appended,
                        alias_appended: false,
                    });
                }
                None => tracing::warn!(
                    owner = %owner,
                    rule = %rule.rule_id,
                    entity = %target,
                    "force-link target missing; resolving normally"
                ),
            }
        }

        if ruleset.is_blocked(&ctx) {
            return Ok(blocked(
                &candidate.kind,
                BlockReason::Token {
                    token: ctx.folded_label.clone(),
                },
            ));
        }
        if let Some(rule) = ruleset.blocking_pattern(&ctx) {
            return Ok(blocked(
                &candidate.kind,
                BlockReason::Pattern {
                    rule_id: rule.rule_id,
                },
            ));
        }

        let kind = ruleset
            .kind_override(&ctx)
            .unwrap_or_else(|| candidate.kind.clone());
        let Ok(normalized) = normalize::normalize_label(&candidate.label, &kind) else {
            return Ok(blocked(&kind, BlockReason::EmptyLabel));
        };
        let name = normalized.normalized_name;
        let ctx = MatchContext::new(&candidate.label, &candidate.snippet, &kind);

        let mut existing = None;
        if let Some(id) = ruleset.forced_alias(&ctx) {
            existing = Some((id, MatchVia::ForcedAlias));
        }
        if existing.is_none() {
            existing = writer
                .find_by_anchor(owner, &kind, &name)?
                .map(|id| (id, MatchVia::Anchor));
        }
        if existing.is_none() {
            existing = writer
                .find_by_alias(owner, &kind, &name)?
                .map(|id| (id, MatchVia::Alias));
        }

        if let Some((raw, via)) = existing {
            let target = self.canonical(ruleset, raw)?;
            if let Some(entity) = writer.get(target)? {
                return self.attach(entry_id, candidate, &name, &entity, via, ruleset, writer);
            }
            tracing::warn!(owner = %owner, entity = %target, via = ?via, "matched entity missing; creating");
        }

        let entity = CanonicalEntity::new(owner, kind.clone(), candidate.label.trim(), name.clone());
        let entity_id = entity.id;
        writer.create(entity)?;
        let alias_appended = writer.add_alias(EntityAlias::new(
            entity_id,
            candidate.label.trim(),
            name,
            AliasType::Canonical,
        ))?;
        let evidence_appended = writer.add_evidence(
            EntityEvidence::new(
                entity_id,
                entry_id,
                EvidenceType::Mention,
                candidate.snippet.clone(),
            )
            .with_property(CONCEPTS_PROPERTY),
        )?;

        Ok(ResolvedCandidate {
            label: candidate.label.clone(),
            kind,
            resolution: Resolution::Created { entity_id },
            evidence_appended,
            alias_appended,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn attach(
        &self,
        entry_id: EntryId,
        candidate: &Candidate,
        normalized_name: &str,
        entity: &CanonicalEntity,
        via: MatchVia,
        ruleset: &PolicyRuleset,
        writer: &mut EntryWriter<'_>,
    ) -> CanonryResult<ResolvedCandidate> {
        let mut alias_appended = false;
        if self.config.record_surface_aliases && normalized_name != entity.normalized_name {
            let alias_type = if via == MatchVia::ForcedAlias {
                AliasType::Forced
            } else {
                AliasType::Surface
            };
            alias_appended = writer.add_alias(EntityAlias::new(
                entity.id,
                candidate.label.trim(),
                normalized_name,
                alias_type,
            ))?;
        }
        let evidence_appended = writer.add_evidence(
            EntityEvidence::new(
                entity.id,
                entry_id,
                EvidenceType::Mention,
                candidate.snippet.clone(),
            )
            .with_property(CONCEPTS_PROPERTY),
        )?;
        if evidence_appended || alias_appended {
            writer.touch(entity.id)?;
        }

        Ok(ResolvedCandidate {
            label: candidate.label.clone(),
            kind: effective_entity_kind(ruleset, entity),
            resolution: Resolution::MatchedExisting {
                entity_id: entity.id,
                via,
            },
            evidence_appended,
            alias_appended,
        })
    }

    /// Ruleset redirects, then store redirects.
    fn canonical(&self, ruleset: &PolicyRuleset, id: EntityId) -> CanonryResult<EntityId> {
        let after_rules = ruleset
            .resolve_redirect(id, self.hop_limit)
            .map_err(|e| CanonryError::internal(format!("ruleset redirects: {e}")))?;
        self.store.resolve_canonical(after_rules)
    }
}

fn effective_entity_kind(ruleset: &PolicyRuleset, entity: &CanonicalEntity) -> EntityKind {
    ruleset
        .entity_kind(entity.id)
        .cloned()
        .unwrap_or_else(|| entity.kind.clone())
}
