//! Canonical entity records and identity types.
//!
//! A canonical entity is the single authoritative record for one real-world
//! referent of one owner. Aliases and evidence hang off it by id; merges never
//! delete an entity, they redirect it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize;

uuid_id! {
    /// Stable identifier of a canonical entity.
    ///
    /// Once created an `EntityId` never changes; a merged-away id keeps
    /// existing and redirects to the entity that absorbed it.
    EntityId
}

uuid_id! {
    /// Identifier of the user that owns entities, rulesets and cases.
    OwnerId
}

uuid_id! {
    /// Identifier of a journal entry (the unit of extraction and replay).
    EntryId
}

uuid_id! {
    /// Identifier of an alias row.
    AliasId
}

uuid_id! {
    /// Identifier of an evidence row.
    EvidenceId
}

/// Classification of entities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A human person.
    Person,
    /// A geographic location or venue.
    Place,
    /// A team, club, or group of people.
    Team,
    /// Something that happened at a point in time.
    Event,
    /// A personal goal.
    Goal,
    /// A monetary or numeric amount.
    Amount,
    /// A time of day.
    Time,
    /// A calendar year.
    Year,
    /// Any other label produced by extraction.
    Custom(String),
}

impl EntityKind {
    /// Maps an extraction type label onto a kind.
    ///
    /// Unknown labels become [`EntityKind::Custom`] with the folded label.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        let folded = normalize::fold(label);
        match folded.as_str() {
            "person" | "people" | "persona" => Self::Person,
            "place" | "location" | "luogo" => Self::Place,
            "team" | "group" | "squadra" => Self::Team,
            "event" | "evento" => Self::Event,
            "goal" | "obiettivo" => Self::Goal,
            "amount" | "money" | "importo" => Self::Amount,
            "time" | "ora" => Self::Time,
            "year" | "anno" => Self::Year,
            _ => Self::Custom(folded),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Person => write!(f, "person"),
            Self::Place => write!(f, "place"),
            Self::Team => write!(f, "team"),
            Self::Event => write!(f, "event"),
            Self::Goal => write!(f, "goal"),
            Self::Amount => write!(f, "amount"),
            Self::Time => write!(f, "time"),
            Self::Year => write!(f, "year"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// The authoritative record for one real-world referent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub owner_id: OwnerId,
    pub kind: EntityKind,
    pub canonical_name: String,
    pub normalized_name: String,
    pub anchor_key: String,

    /// Opaque summary card maintained by downstream consumers.
    #[serde(default)]
    pub summary: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEntity {
    /// Creates a new entity from an already-normalized name.
    #[must_use]
    pub fn new(
        owner_id: OwnerId,
        kind: EntityKind,
        canonical_name: impl Into<String>,
        normalized_name: impl Into<String>,
    ) -> Self {
        let normalized_name = normalized_name.into();
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            owner_id,
            anchor_key: normalize::anchor_key(&kind, &normalized_name),
            kind,
            canonical_name: canonical_name.into(),
            normalized_name,
            summary: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

impl PartialEq for CanonicalEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CanonicalEntity {}

/// How an alias came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasType {
    /// The surface form the entity was created from.
    Canonical,
    /// A later surface form seen in a mention.
    Surface,
    /// An alias pinned by a `set_alias` correction.
    Forced,
}

/// An alternative surface form of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAlias {
    pub id: AliasId,
    pub entity_id: EntityId,
    pub alias: String,
    pub normalized_alias: String,
    pub alias_type: AliasType,
    pub created_at: DateTime<Utc>,
}

impl EntityAlias {
    /// Creates a new alias row.
    #[must_use]
    pub fn new(
        entity_id: EntityId,
        alias: impl Into<String>,
        normalized_alias: impl Into<String>,
        alias_type: AliasType,
    ) -> Self {
        Self {
            id: AliasId::new(),
            entity_id,
            alias: alias.into(),
            normalized_alias: normalized_alias.into(),
            alias_type,
            created_at: Utc::now(),
        }
    }
}

/// Why a piece of evidence was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    /// Regular resolution of a mention.
    Mention,
    /// A force-link rule routed the mention here.
    ForcedLink,
}

/// One mention of an entity in one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityEvidence {
    pub id: EvidenceId,
    pub entity_id: EntityId,
    pub source_entry_id: EntryId,
    pub evidence_type: EvidenceType,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EntityEvidence {
    /// Creates a new evidence row.
    #[must_use]
    pub fn new(
        entity_id: EntityId,
        source_entry_id: EntryId,
        evidence_type: EvidenceType,
        snippet: impl Into<String>,
    ) -> Self {
        Self {
            id: EvidenceId::new(),
            entity_id,
            source_entry_id,
            evidence_type,
            snippet: snippet.into(),
            property_name: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the property the mention came from.
    #[must_use]
    pub fn with_property(mut self, property_name: impl Into<String>) -> Self {
        self.property_name = Some(property_name.into());
        self
    }

    /// The uniqueness key, relative to a given owning entity.
    #[must_use]
    pub fn key_for(&self, entity_id: EntityId) -> EvidenceKey {
        EvidenceKey {
            entity_id,
            source_entry_id: self.source_entry_id,
            evidence_type: self.evidence_type,
            snippet: self.snippet.clone(),
        }
    }

    /// The uniqueness key of this row.
    #[must_use]
    pub fn key(&self) -> EvidenceKey {
        self.key_for(self.entity_id)
    }
}

/// `(entity, entry, type, snippet)` uniqueness key of evidence rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvidenceKey {
    pub entity_id: EntityId,
    pub source_entry_id: EntryId,
    pub evidence_type: EvidenceType,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(EntityId::new(), EntityId::new());
        assert_ne!(OwnerId::new(), OwnerId::new());
    }

    #[test]
    fn test_kind_from_label() {
        assert_eq!(EntityKind::from_label("Person"), EntityKind::Person);
        assert_eq!(EntityKind::from_label(" LOCATION "), EntityKind::Place);
        assert_eq!(EntityKind::from_label("goal"), EntityKind::Goal);
        assert_eq!(
            EntityKind::from_label("Hobby"),
            EntityKind::Custom("hobby".to_string())
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EntityKind::Person.to_string(), "person");
        assert_eq!(EntityKind::Custom("pet".to_string()).to_string(), "custom:pet");
    }

    #[test]
    fn test_entity_anchor_derived() {
        let owner = OwnerId::new();
        let entity = CanonicalEntity::new(owner, EntityKind::Person, "Mario", "mario");
        assert_eq!(entity.anchor_key, "person:mario");
        assert_eq!(entity.created_at, entity.updated_at);
    }

    #[test]
    fn test_evidence_key_ignores_row_id() {
        let entity = EntityId::new();
        let entry = EntryId::new();
        let a = EntityEvidence::new(entity, entry, EvidenceType::Mention, "saw Mario");
        let b = EntityEvidence::new(entity, entry, EvidenceType::Mention, "saw Mario");
        assert_ne!(a.id, b.id);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_entity_serialization() {
        let entity = CanonicalEntity::new(OwnerId::new(), EntityKind::Team, "Juve", "juve");
        let json = serde_json::to_string(&entity).unwrap();
        let back: CanonicalEntity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, entity.id);
        assert_eq!(back.kind, EntityKind::Team);
    }
}
