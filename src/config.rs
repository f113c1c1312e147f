//! Runtime configuration.
//!
//! Every section has working defaults; a JSON document only needs to name
//! the fields it overrides.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::redirect::DEFAULT_HOP_LIMIT;

/// Entity resolution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Labels longer than this (in chars) are blocked instead of resolved.
    pub max_label_len: usize,
    /// Record new surface forms as aliases on matched entities.
    pub record_surface_aliases: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_label_len: 256,
            record_surface_aliases: true,
        }
    }
}

/// Replay worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Number of replay workers.
    pub workers: usize,
    /// Maximum queued jobs in the pool channel.
    pub queue_capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
        }
    }
}

/// Feedback engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Attach a dry-run replay report to every preview.
    pub dry_run_preview: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonryConfig {
    pub resolver: ResolverConfig,
    pub replay: ReplayConfig,
    pub feedback: FeedbackConfig,
    /// Maximum redirect hops followed before a chain is treated as corrupt.
    pub redirect_hop_limit: usize,
}

impl Default for CanonryConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            replay: ReplayConfig::default(),
            feedback: FeedbackConfig::default(),
            redirect_hop_limit: DEFAULT_HOP_LIMIT,
        }
    }
}

impl CanonryConfig {
    /// Parses a JSON document, filling unspecified fields with defaults.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidConfig`] for malformed JSON or
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidConfig`] naming the bad field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let bad = |reason: &str| {
            Err(ValidationError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.resolver.max_label_len == 0 {
            return bad("resolver.max_label_len must be positive");
        }
        if self.replay.queue_capacity == 0 {
            return bad("replay.queue_capacity must be positive");
        }
        if self.redirect_hop_limit == 0 {
            return bad("redirect_hop_limit must be positive");
        }
        Ok(())
    }
}
