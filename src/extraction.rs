//! Extraction input and resolution candidates.
//!
//! The language-model analysis of an entry arrives as an [`AnalysisResult`].
//! Only `concepts` matter for entity resolution; each concept becomes one
//! [`Candidate`] in extraction order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, EntryId, OwnerId};

/// One labeled span produced by extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub label: String,
    #[serde(rename = "type")]
    pub concept_type: String,
    /// Surrounding text; defaults to the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Raw analysis of one journal entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(default)]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub goal_signals: Vec<serde_json::Value>,
    #[serde(default)]
    pub goal_completions: Vec<serde_json::Value>,
    #[serde(default)]
    pub energy_level: Option<f64>,
    #[serde(default)]
    pub stress_level: Option<f64>,
}

impl AnalysisResult {
    /// Resolution candidates for `entry_id`, in extraction order.
    #[must_use]
    pub fn candidates(&self, entry_id: EntryId) -> Vec<Candidate> {
        self.concepts
            .iter()
            .map(|c| Candidate {
                label: c.label.clone(),
                kind: EntityKind::from_label(&c.concept_type),
                source_entry_id: entry_id,
                snippet: c.snippet.clone().unwrap_or_else(|| c.label.clone()),
            })
            .collect()
    }
}

/// One mention to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub label: String,
    pub kind: EntityKind,
    pub source_entry_id: EntryId,
    pub snippet: String,
}

impl Candidate {
    /// Creates a candidate whose snippet is the label itself.
    #[must_use]
    pub fn new(label: impl Into<String>, kind: EntityKind, source_entry_id: EntryId) -> Self {
        let label = label.into();
        Self {
            snippet: label.clone(),
            label,
            kind,
            source_entry_id,
        }
    }

    /// Sets the evidence snippet.
    #[must_use]
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }
}

/// Stored extraction of one entry, replayed after policy changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry_id: EntryId,
    pub owner_id: OwnerId,
    pub candidates: Vec<Candidate>,
    pub recorded_at: DateTime<Utc>,
}

impl EntryRecord {
    /// Creates a record stamped now.
    #[must_use]
    pub fn new(entry_id: EntryId, owner_id: OwnerId, candidates: Vec<Candidate>) -> Self {
        Self {
            entry_id,
            owner_id,
            candidates,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_from_json() {
        let json = r#"{
            "emotions": ["joy"],
            "concepts": [
                {"label": "Mario", "type": "person"},
                {"label": "Roma", "type": "place", "snippet": "trip to Roma"}
            ],
            "goalSignals": [],
            "energyLevel": 0.7
        }"#;
        let analysis: AnalysisResult = serde_json::from_str(json).unwrap();
        assert_eq!(analysis.concepts.len(), 2);
        assert_eq!(analysis.energy_level, Some(0.7));
        assert!(analysis.stress_level.is_none());

        let entry = EntryId::new();
        let candidates = analysis.candidates(entry);
        assert_eq!(candidates[0].kind, EntityKind::Person);
        assert_eq!(candidates[0].snippet, "Mario");
        assert_eq!(candidates[1].kind, EntityKind::Place);
        assert_eq!(candidates[1].snippet, "trip to Roma");
        assert!(candidates.iter().all(|c| c.source_entry_id == entry));
    }

    #[test]
    fn test_candidate_builder() {
        let c = Candidate::new("Mario", EntityKind::Person, EntryId::new()).with_snippet("with Mario");
        assert_eq!(c.label, "Mario");
        assert_eq!(c.snippet, "with Mario");
    }
}
