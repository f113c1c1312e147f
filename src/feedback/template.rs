//! Correction templates and payload parsing.
//!
//! A template id names the shape of its payload: either the fields of one
//! action kind, or a batch `{ "actions": [ {"action": ..., ...}, ... ] }`.
//! Payloads are parsed once here into [`PolicyAction`]s; nothing past this
//! boundary sees raw JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::policy::{PolicyAction, RuleId};

use super::case::CaseId;

/// Template id of the batch shape.
pub const BATCH_TEMPLATE: &str = "batch";

/// Template id recorded on revert cases.
pub const REVERT_TEMPLATE: &str = "revert";

const ACTION_NAMES: [&str; 12] = [
    "block_token",
    "set_alias",
    "force_link",
    "set_entity_type",
    "merge_entities",
    "unmerge",
    "pattern_rule",
    "unblock_token",
    "clear_alias",
    "remove_force_link",
    "clear_entity_type",
    "remove_pattern_rule",
];

/// A correction as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub template_id: String,
    pub payload: Value,
}

impl TemplateRequest {
    #[must_use]
    pub fn new(template_id: impl Into<String>, payload: Value) -> Self {
        Self {
            template_id: template_id.into(),
            payload,
        }
    }
}

/// Payload shape of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateShape {
    /// Payload holds the fields of one action of this name.
    Single(String),
    /// Payload holds `{ "actions": [...] }`.
    Batch,
}

/// Registry of template ids.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    shapes: BTreeMap<String, TemplateShape>,
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateCatalog {
    /// Catalog with one template per action name plus `batch`.
    #[must_use]
    pub fn builtin() -> Self {
        let mut shapes: BTreeMap<String, TemplateShape> = ACTION_NAMES
            .iter()
            .map(|name| ((*name).to_string(), TemplateShape::Single((*name).to_string())))
            .collect();
        shapes.insert(BATCH_TEMPLATE.to_string(), TemplateShape::Batch);
        Self { shapes }
    }

    /// Registers (or replaces) a template id.
    ///
    /// # Errors
    /// Returns [`ValidationError::UnknownTemplate`] if a single-action shape
    /// names an action that does not exist.
    pub fn register(
        &mut self,
        template_id: impl Into<String>,
        shape: TemplateShape,
    ) -> Result<(), ValidationError> {
        if let TemplateShape::Single(name) = &shape {
            if !ACTION_NAMES.contains(&name.as_str()) {
                return Err(ValidationError::UnknownTemplate {
                    template_id: name.clone(),
                });
            }
        }
        self.shapes.insert(template_id.into(), shape);
        Ok(())
    }

    #[must_use]
    pub fn shape(&self, template_id: &str) -> Option<&TemplateShape> {
        self.shapes.get(template_id)
    }

    /// Parses and validates `request` into actions for case `case_id`.
    ///
    /// Force-link and pattern rules without a rule id get one derived from
    /// the case id and the action index, so re-parsing is stable.
    ///
    /// # Errors
    /// - [`ValidationError::UnknownTemplate`] for an unregistered id
    /// - [`ValidationError::InvalidPayload`] when the payload has the wrong shape
    /// - [`ValidationError::InvalidAction`] when an action fails validation
    /// - [`ValidationError::EmptyActionSet`] for an empty batch
    pub fn parse(
        &self,
        case_id: CaseId,
        request: &TemplateRequest,
    ) -> Result<Vec<PolicyAction>, ValidationError> {
        let template_id = request.template_id.as_str();
        let shape = self
            .shape(template_id)
            .ok_or_else(|| ValidationError::UnknownTemplate {
                template_id: template_id.to_string(),
            })?;
        let invalid = |reason: String| ValidationError::InvalidPayload {
            template_id: template_id.to_string(),
            reason,
        };

        let raw: Vec<Value> = match shape {
            TemplateShape::Single(name) => {
                let Value::Object(mut fields) = request.payload.clone() else {
                    return Err(invalid("payload must be a JSON object".to_string()));
                };
                fields.insert("action".to_string(), Value::String(name.clone()));
                vec![Value::Object(fields)]
            }
            TemplateShape::Batch => match request.payload.get("actions") {
                Some(Value::Array(items)) => items.clone(),
                Some(_) => return Err(invalid("'actions' must be an array".to_string())),
                None => return Err(invalid("missing 'actions'".to_string())),
            },
        };
        if raw.is_empty() {
            return Err(ValidationError::EmptyActionSet);
        }

        raw.into_iter()
            .enumerate()
            .map(|(index, value)| {
                let mut action: PolicyAction = serde_json::from_value(value)
                    .map_err(|e| ValidationError::InvalidAction {
                        index,
                        reason: e.to_string(),
                    })?;
                assign_rule_id(&mut action, case_id, index);
                action
                    .validate()
                    .map_err(|reason| ValidationError::InvalidAction { index, reason })?;
                Ok(action)
            })
            .collect()
    }
}

/// Rule id for the `index`-th action of a case.
#[must_use]
pub fn derived_rule_id(case_id: CaseId, index: usize) -> RuleId {
    let index = u64::try_from(index).unwrap_or(u64::MAX);
    RuleId::from_uuid(Uuid::new_v5(case_id.as_uuid(), &index.to_be_bytes()))
}

fn assign_rule_id(action: &mut PolicyAction, case_id: CaseId, index: usize) {
    let rule_id = match action {
        PolicyAction::ForceLink { rule } => &mut rule.rule_id,
        PolicyAction::PatternRule { rule } => &mut rule.rule_id,
        _ => return,
    };
    if rule_id.is_nil() {
        *rule_id = derived_rule_id(case_id, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, EntityKind};
    use crate::policy::{BlockScope, ForceLinkMatcher};
    use serde_json::json;

    #[test]
    fn test_single_template() {
        let catalog = TemplateCatalog::builtin();
        let request = TemplateRequest::new("block_token", json!({"token": "Mario", "scope": "person"}));
        let actions = catalog.parse(CaseId::new(), &request).unwrap();
        assert_eq!(
            actions,
            vec![PolicyAction::BlockToken {
                token: "Mario".to_string(),
                scope: BlockScope::Person,
            }]
        );
    }

    #[test]
    fn test_batch_template_derives_rule_ids() {
        let catalog = TemplateCatalog::builtin();
        let case_id = CaseId::new();
        let target = EntityId::new();
        let request = TemplateRequest::new(
            "batch",
            json!({"actions": [
                {"action": "set_entity_type", "token": "Juve", "kind": "team"},
                {"action": "force_link", "rule": {
                    "entity_id": target,
                    "matcher": {"mode": "exact", "text": "zio"}
                }}
            ]}),
        );
        let actions = catalog.parse(case_id, &request).unwrap();
        assert_eq!(actions.len(), 2);
        match &actions[1] {
            PolicyAction::ForceLink { rule } => {
                assert_eq!(rule.rule_id, derived_rule_id(case_id, 1));
                assert_eq!(rule.entity_id, target);
                assert_eq!(
                    rule.matcher,
                    ForceLinkMatcher::Exact {
                        text: "zio".to_string()
                    }
                );
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(
            catalog.parse(case_id, &request).unwrap(),
            actions,
            "re-parsing must be stable"
        );
        assert!(matches!(
            &actions[0],
            PolicyAction::SetEntityType { kind: EntityKind::Team, .. }
        ));
    }

    #[test]
    fn test_parse_errors() {
        let catalog = TemplateCatalog::builtin();
        let case_id = CaseId::new();

        let err = catalog
            .parse(case_id, &TemplateRequest::new("nope", json!({})))
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownTemplate { .. }));

        let err = catalog
            .parse(case_id, &TemplateRequest::new("batch", json!({"actions": []})))
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptyActionSet);

        let err = catalog
            .parse(case_id, &TemplateRequest::new("block_token", json!("Mario")))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPayload { .. }));

        let err = catalog
            .parse(case_id, &TemplateRequest::new("block_token", json!({"token": "  "})))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAction { index: 0, .. }));

        let id = EntityId::new();
        let err = catalog
            .parse(
                case_id,
                &TemplateRequest::new("merge_entities", json!({"losing_id": id, "winning_id": id})),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAction { .. }));
    }

    #[test]
    fn test_register_custom_template() {
        let mut catalog = TemplateCatalog::builtin();
        catalog
            .register("not_a_person", TemplateShape::Single("block_token".to_string()))
            .unwrap();
        assert!(catalog
            .register("bad", TemplateShape::Single("explode".to_string()))
            .is_err());

        let actions = catalog
            .parse(CaseId::new(), &TemplateRequest::new("not_a_person", json!({"token": "Inter"})))
            .unwrap();
        assert_eq!(actions[0].name(), "block_token");
    }
}
