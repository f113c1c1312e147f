//! Policy actions: the closed set of corrections a feedback case can carry.
//!
//! Payloads are parsed into these variants once, at the feedback boundary.
//! Everything downstream (compilation, impact estimation, revert) works on the
//! typed variants only.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityKind};
use crate::normalize;

use super::matching::cached_regex;

uuid_id! {
    /// Identifier of a force-link or pattern rule.
    RuleId
}

/// Which candidate kinds a blocked token applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockScope {
    /// Every kind.
    #[default]
    Any,
    /// Person candidates only.
    Person,
    /// Goal candidates only.
    Goal,
}

impl BlockScope {
    /// Returns true if this scope covers candidates of `kind`.
    #[must_use]
    pub fn covers(self, kind: &EntityKind) -> bool {
        match self {
            Self::Any => true,
            Self::Person => *kind == EntityKind::Person,
            Self::Goal => *kind == EntityKind::Goal,
        }
    }
}

impl fmt::Display for BlockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Person => write!(f, "person"),
            Self::Goal => write!(f, "goal"),
        }
    }
}

/// How a force-link rule recognizes a mention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ForceLinkMatcher {
    /// The folded label equals the folded text.
    Exact { text: String },
    /// All tokens occur within `window` consecutive tokens of the snippet.
    NearTokens { tokens: Vec<String>, window: usize },
    /// A regex matches the raw label or snippet.
    Generic { pattern: String },
}

impl ForceLinkMatcher {
    /// Specificity rank; higher wins.
    #[must_use]
    pub const fn specificity(&self) -> u8 {
        match self {
            Self::Exact { .. } => 3,
            Self::NearTokens { .. } => 2,
            Self::Generic { .. } => 1,
        }
    }
}

/// Routes matching mentions straight to a target entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceLinkRule {
    #[serde(default = "RuleId::nil")]
    pub rule_id: RuleId,
    pub entity_id: EntityId,
    pub matcher: ForceLinkMatcher,
    /// Restricts the rule to candidates of this kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntityKind>,
    /// Fold position; later rules win ties.
    #[serde(default)]
    pub sequence: u64,
}

/// What a pattern rule does to a matching candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum PatternEffect {
    /// Drop the candidate.
    Block,
    /// Resolve the candidate as a different kind.
    SetKind { target_kind: EntityKind },
}

/// Generic regex rule over candidate labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    #[serde(default = "RuleId::nil")]
    pub rule_id: RuleId,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntityKind>,
    #[serde(flatten)]
    pub effect: PatternEffect,
    #[serde(default)]
    pub sequence: u64,
}

/// One correction.
///
/// The first seven variants are what templates produce; the remaining ones
/// are inverses emitted by revert (templates may use them too).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PolicyAction {
    BlockToken {
        token: String,
        #[serde(default)]
        scope: BlockScope,
    },
    SetAlias {
        alias: String,
        entity_id: EntityId,
    },
    ForceLink {
        rule: ForceLinkRule,
    },
    SetEntityType {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        kind: EntityKind,
    },
    MergeEntities {
        losing_id: EntityId,
        winning_id: EntityId,
    },
    Unmerge {
        losing_id: EntityId,
    },
    PatternRule {
        rule: PatternRule,
    },
    UnblockToken {
        token: String,
        #[serde(default)]
        scope: BlockScope,
    },
    ClearAlias {
        alias: String,
    },
    RemoveForceLink {
        rule_id: RuleId,
    },
    ClearEntityType {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    RemovePatternRule {
        rule_id: RuleId,
    },
}

impl PolicyAction {
    /// Snake-case action name, as used in payloads.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BlockToken { .. } => "block_token",
            Self::SetAlias { .. } => "set_alias",
            Self::ForceLink { .. } => "force_link",
            Self::SetEntityType { .. } => "set_entity_type",
            Self::MergeEntities { .. } => "merge_entities",
            Self::Unmerge { .. } => "unmerge",
            Self::PatternRule { .. } => "pattern_rule",
            Self::UnblockToken { .. } => "unblock_token",
            Self::ClearAlias { .. } => "clear_alias",
            Self::RemoveForceLink { .. } => "remove_force_link",
            Self::ClearEntityType { .. } => "clear_entity_type",
            Self::RemovePatternRule { .. } => "remove_pattern_rule",
        }
    }

    /// Structural validation; does not consult any store.
    ///
    /// # Errors
    /// Returns a human-readable reason when the action is malformed.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::BlockToken { token, .. } | Self::UnblockToken { token, .. } => {
                non_empty_token("token", token)
            }
            Self::SetAlias { alias, entity_id } => {
                non_empty_token("alias", alias)?;
                non_nil(*entity_id, "entity_id")
            }
            Self::ClearAlias { alias } => non_empty_token("alias", alias),
            Self::ForceLink { rule } => {
                non_nil(rule.entity_id, "entity_id")?;
                validate_matcher(&rule.matcher)
            }
            Self::SetEntityType {
                entity_id, token, ..
            }
            | Self::ClearEntityType { entity_id, token } => match (entity_id, token) {
                (Some(id), None) => non_nil(*id, "entity_id"),
                (None, Some(t)) => non_empty_token("token", t),
                _ => Err("exactly one of 'entity_id' or 'token' is required".to_string()),
            },
            Self::MergeEntities {
                losing_id,
                winning_id,
            } => {
                non_nil(*losing_id, "losing_id")?;
                non_nil(*winning_id, "winning_id")?;
                if losing_id == winning_id {
                    return Err("cannot merge an entity into itself".to_string());
                }
                Ok(())
            }
            Self::Unmerge { losing_id } => non_nil(*losing_id, "losing_id"),
            Self::PatternRule { rule } => {
                if rule.pattern.trim().is_empty() {
                    return Err("pattern is empty".to_string());
                }
                cached_regex(&rule.pattern).map(|_| ()).map_err(|e| e.to_string())
            }
            Self::RemoveForceLink { rule_id } | Self::RemovePatternRule { rule_id } => {
                if rule_id.is_nil() {
                    return Err("'rule_id' must not be nil".to_string());
                }
                Ok(())
            }
        }
    }
}

fn non_empty_token(field: &str, value: &str) -> Result<(), String> {
    if normalize::fold(value).is_empty() {
        return Err(format!("'{field}' is empty after normalization"));
    }
    Ok(())
}

fn non_nil(id: EntityId, field: &str) -> Result<(), String> {
    if id.is_nil() {
        return Err(format!("'{field}' must not be nil"));
    }
    Ok(())
}

fn validate_matcher(matcher: &ForceLinkMatcher) -> Result<(), String> {
    match matcher {
        ForceLinkMatcher::Exact { text } => non_empty_token("text", text),
        ForceLinkMatcher::NearTokens { tokens, window } => {
            let folded: Vec<String> = tokens.iter().flat_map(|t| normalize::tokens(t)).collect();
            if folded.is_empty() {
                return Err("near_tokens needs at least one token".to_string());
            }
            if *window < folded.len() {
                return Err(format!(
                    "window {window} is smaller than the {} tokens it must contain",
                    folded.len()
                ));
            }
            Ok(())
        }
        ForceLinkMatcher::Generic { pattern } => {
            if pattern.trim().is_empty() {
                return Err("pattern is empty".to_string());
            }
            cached_regex(pattern).map(|_| ()).map_err(|e| e.to_string())
        }
    }
}
