//! Inverse actions for reverting an applied case.

use crate::normalize;
use crate::policy::{PolicyAction, PolicyRuleset};

/// Actions that undo `actions`, in the order they must be applied.
///
/// `before` is the ruleset the case was folded over. Each action is
/// inverted against the state immediately preceding it, and the inverses
/// come out in reverse order. Actions that changed nothing have no inverse.
#[must_use]
pub fn invert(before: &PolicyRuleset, actions: &[PolicyAction]) -> Vec<PolicyAction> {
    let mut state = before.clone();
    let mut inverses = Vec::with_capacity(actions.len());
    for action in actions {
        if let Some(inverse) = inverse_of(&state, action) {
            inverses.push(inverse);
        }
        state.apply(action);
    }
    inverses.reverse();
    inverses
}

/// Inverse of one action against `state`, or `None` if it is a no-op there.
#[must_use]
pub fn inverse_of(state: &PolicyRuleset, action: &PolicyAction) -> Option<PolicyAction> {
    match action {
        PolicyAction::BlockToken { token, scope } => {
            (!is_blocked(state, token, *scope)).then(|| PolicyAction::UnblockToken {
                token: token.clone(),
                scope: *scope,
            })
        }
        PolicyAction::UnblockToken { token, scope } => {
            is_blocked(state, token, *scope).then(|| PolicyAction::BlockToken {
                token: token.clone(),
                scope: *scope,
            })
        }
        PolicyAction::SetAlias { alias, entity_id } => {
            match state.forced_aliases.get(&normalize::fold(alias)) {
                Some(prev) if prev == entity_id => None,
                Some(prev) => Some(PolicyAction::SetAlias {
                    alias: alias.clone(),
                    entity_id: *prev,
                }),
                None => Some(PolicyAction::ClearAlias {
                    alias: alias.clone(),
                }),
            }
        }
        PolicyAction::ClearAlias { alias } => state
            .forced_aliases
            .get(&normalize::fold(alias))
            .map(|prev| PolicyAction::SetAlias {
                alias: alias.clone(),
                entity_id: *prev,
            }),
        PolicyAction::ForceLink { rule } => Some(match state.force_links.get(&rule.rule_id) {
            Some(prev) => PolicyAction::ForceLink { rule: prev.clone() },
            None => PolicyAction::RemoveForceLink {
                rule_id: rule.rule_id,
            },
        }),
        PolicyAction::RemoveForceLink { rule_id } => state
            .force_links
            .get(rule_id)
            .map(|prev| PolicyAction::ForceLink { rule: prev.clone() }),
        PolicyAction::SetEntityType {
            entity_id, token, ..
        }
        | PolicyAction::ClearEntityType { entity_id, token } => {
            let prev = match (entity_id, token) {
                (Some(id), _) => state.entity_type_overrides.get(id),
                (None, Some(t)) => state.token_type_overrides.get(&normalize::fold(t)),
                (None, None) => return None,
            };
            match (prev, action) {
                (Some(kind), _) => Some(PolicyAction::SetEntityType {
                    entity_id: *entity_id,
                    token: token.clone(),
                    kind: kind.clone(),
                }),
                (None, PolicyAction::SetEntityType { .. }) => Some(PolicyAction::ClearEntityType {
                    entity_id: *entity_id,
                    token: token.clone(),
                }),
                (None, _) => None,
            }
        }
        PolicyAction::MergeEntities { losing_id, .. } => Some(PolicyAction::Unmerge {
            losing_id: *losing_id,
        }),
        PolicyAction::Unmerge { losing_id } => {
            state
                .redirects
                .get(losing_id)
                .map(|target| PolicyAction::MergeEntities {
                    losing_id: *losing_id,
                    winning_id: *target,
                })
        }
        PolicyAction::PatternRule { rule } => Some(match state.pattern_rules.get(&rule.rule_id) {
            Some(prev) => PolicyAction::PatternRule { rule: prev.clone() },
            None => PolicyAction::RemovePatternRule {
                rule_id: rule.rule_id,
            },
        }),
        PolicyAction::RemovePatternRule { rule_id } => state
            .pattern_rules
            .get(rule_id)
            .map(|prev| PolicyAction::PatternRule { rule: prev.clone() }),
    }
}

fn is_blocked(state: &PolicyRuleset, token: &str, scope: crate::policy::BlockScope) -> bool {
    state
        .blocked_tokens
        .get(&scope)
        .is_some_and(|set| set.contains(&normalize::fold(token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, EntityKind, OwnerId};
    use crate::policy::{BlockScope, ForceLinkMatcher, ForceLinkRule, RuleId};

    fn folded(base: &PolicyRuleset, actions: &[PolicyAction]) -> PolicyRuleset {
        let mut rs = base.clone();
        for a in actions {
            rs.apply(a);
        }
        rs
    }

    /// Rule content without fold sequence numbers.
    fn shape(rs: &PolicyRuleset) -> PolicyRuleset {
        let mut rs = rs.clone();
        rs.actions_folded = 0;
        for rule in rs.force_links.values_mut() {
            rule.sequence = 0;
        }
        for rule in rs.pattern_rules.values_mut() {
            rule.sequence = 0;
        }
        rs
    }

    #[test]
    fn test_invert_restores_rules() {
        let owner = OwnerId::new();
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        let mut before = PolicyRuleset::empty(owner);
        before.apply(&PolicyAction::SetAlias {
            alias: "Bob".to_string(),
            entity_id: a,
        });
        before.apply(&PolicyAction::MergeEntities {
            losing_id: b,
            winning_id: c,
        });

        let actions = vec![
            PolicyAction::BlockToken {
                token: "Mario".to_string(),
                scope: BlockScope::Person,
            },
            PolicyAction::SetAlias {
                alias: "bob".to_string(),
                entity_id: b,
            },
            PolicyAction::ForceLink {
                rule: ForceLinkRule {
                    rule_id: RuleId::new(),
                    entity_id: c,
                    matcher: ForceLinkMatcher::Exact {
                        text: "boss".to_string(),
                    },
                    kind: None,
                    sequence: 0,
                },
            },
            PolicyAction::SetEntityType {
                entity_id: None,
                token: Some("Juve".to_string()),
                kind: EntityKind::Team,
            },
            PolicyAction::Unmerge { losing_id: b },
            PolicyAction::MergeEntities {
                losing_id: a,
                winning_id: c,
            },
        ];
        let after = folded(&before, &actions);
        let inverses = invert(&before, &actions);
        assert_eq!(inverses.len(), actions.len());
        assert_eq!(
            inverses[0],
            PolicyAction::Unmerge { losing_id: a },
            "inverses run in reverse order"
        );

        let restored = folded(&after, &inverses);
        assert_eq!(shape(&restored), shape(&before));
    }

    #[test]
    fn test_noop_actions_have_no_inverse() {
        let owner = OwnerId::new();
        let mut before = PolicyRuleset::empty(owner);
        before.apply(&PolicyAction::BlockToken {
            token: "x".to_string(),
            scope: BlockScope::Any,
        });
        let actions = vec![
            PolicyAction::BlockToken {
                token: "X".to_string(),
                scope: BlockScope::Any,
            },
            PolicyAction::Unmerge {
                losing_id: EntityId::new(),
            },
            PolicyAction::ClearAlias {
                alias: "nobody".to_string(),
            },
        ];
        assert!(invert(&before, &actions).is_empty());
    }
}
