//! Rule matching against a candidate mention.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::entity::EntityKind;
use crate::error::ValidationError;
use crate::normalize;

use super::action::{ForceLinkMatcher, ForceLinkRule, PatternRule};

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();

/// Compiles `pattern`, reusing a process-wide bounded cache.
///
/// # Errors
/// Returns [`ValidationError::InvalidPatternRule`] for an invalid regex.
pub fn cached_regex(pattern: &str) -> Result<Regex, ValidationError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = Regex::new(pattern).map_err(|e| ValidationError::InvalidPatternRule {
        reason: format!("invalid regex '{pattern}': {e}"),
    })?;

    if let Ok(mut guard) = cache.write() {
        if guard.len() >= REGEX_CACHE_MAX {
            // Keep the cache bounded to avoid unbounded memory usage.
            guard.clear();
        }
        guard
            .entry(pattern.to_string())
            .or_insert_with(|| compiled.clone());
    }
    Ok(compiled)
}

/// Precomputed views of one candidate, shared by every rule check.
#[derive(Debug, Clone)]
pub struct MatchContext<'a> {
    pub label: &'a str,
    pub snippet: &'a str,
    pub kind: &'a EntityKind,
    /// Generic fold of the label.
    pub folded_label: String,
    /// Kind-specific normalized name.
    pub normalized_name: String,
    /// Folded tokens of the snippet (the label when there is none).
    pub context_tokens: Vec<String>,
}

impl<'a> MatchContext<'a> {
    /// Builds the context for one mention.
    #[must_use]
    pub fn new(label: &'a str, snippet: &'a str, kind: &'a EntityKind) -> Self {
        let context_tokens = if snippet.trim().is_empty() {
            normalize::tokens(label)
        } else {
            normalize::tokens(snippet)
        };
        Self {
            label,
            snippet,
            kind,
            folded_label: normalize::fold(label),
            normalized_name: normalize::normalize_name(label, kind),
            context_tokens,
        }
    }

    /// Keys a token-keyed rule may match: the fold and the normalized name.
    #[must_use]
    pub fn keys(&self) -> [&str; 2] {
        [self.folded_label.as_str(), self.normalized_name.as_str()]
    }

    /// Returns true if `token` (already folded) equals one of the keys.
    #[must_use]
    pub fn key_matches(&self, token: &str) -> bool {
        self.keys().contains(&token)
    }
}

/// Returns true if `rule` applies to the mention.
#[must_use]
pub fn force_link_matches(rule: &ForceLinkRule, ctx: &MatchContext<'_>) -> bool {
    if let Some(kind) = &rule.kind {
        if kind != ctx.kind {
            return false;
        }
    }
    match &rule.matcher {
        ForceLinkMatcher::Exact { text } => ctx.key_matches(&normalize::fold(text)),
        ForceLinkMatcher::NearTokens { tokens, window } => {
            let wanted: Vec<String> = tokens.iter().flat_map(|t| normalize::tokens(t)).collect();
            tokens_within_window(&ctx.context_tokens, &wanted, *window)
        }
        ForceLinkMatcher::Generic { pattern } => match cached_regex(pattern) {
            Ok(re) => re.is_match(ctx.label) || re.is_match(ctx.snippet),
            Err(_) => false,
        },
    }
}

/// Returns true if `rule` applies to the mention.
#[must_use]
pub fn pattern_matches(rule: &PatternRule, ctx: &MatchContext<'_>) -> bool {
    if let Some(kind) = &rule.kind {
        if kind != ctx.kind {
            return false;
        }
    }
    match cached_regex(&rule.pattern) {
        Ok(re) => re.is_match(ctx.label),
        Err(_) => false,
    }
}

/// All `wanted` tokens appear inside some run of `window` consecutive tokens.
#[must_use]
pub fn tokens_within_window(haystack: &[String], wanted: &[String], window: usize) -> bool {
    if wanted.is_empty() || window == 0 || haystack.is_empty() {
        return false;
    }
    let span = window.min(haystack.len());
    (0..=haystack.len() - span).any(|start| {
        let slice = &haystack[start..start + span];
        wanted.iter().all(|w| slice.contains(w))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use crate::policy::action::{PatternEffect, RuleId};

    fn rule(matcher: ForceLinkMatcher) -> ForceLinkRule {
        ForceLinkRule {
            rule_id: RuleId::new(),
            entity_id: EntityId::new(),
            matcher,
            kind: None,
            sequence: 0,
        }
    }

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_cached_regex_invalid() {
        assert!(cached_regex("[").is_err());
        assert!(cached_regex("^ma").unwrap().is_match("mario"));
    }

    #[test]
    fn test_exact_match_is_folded() {
        let kind = EntityKind::Person;
        let ctx = MatchContext::new("Zio Mário", "Zio Mário", &kind);
        assert!(force_link_matches(
            &rule(ForceLinkMatcher::Exact {
                text: "zio mario".to_string()
            }),
            &ctx
        ));
    }

    #[test]
    fn test_near_tokens_window() {
        let kind = EntityKind::Person;
        let ctx = MatchContext::new("Mario", "dinner with uncle Mario tonight", &kind);
        let near = |window| {
            rule(ForceLinkMatcher::NearTokens {
                tokens: vec!["uncle".to_string(), "mario".to_string()],
                window,
            })
        };
        assert!(force_link_matches(&near(2), &ctx));

        let far = MatchContext::new("Mario", "uncle went home and later Mario called", &kind);
        assert!(!force_link_matches(&near(2), &far));
        assert!(force_link_matches(&near(8), &far));
    }

    #[test]
    fn test_kind_restriction() {
        let team = EntityKind::Team;
        let ctx = MatchContext::new("Mario", "Mario", &team);
        let mut r = rule(ForceLinkMatcher::Exact {
            text: "mario".to_string(),
        });
        r.kind = Some(EntityKind::Person);
        assert!(!force_link_matches(&r, &ctx));
    }

    #[test]
    fn test_generic_matches_snippet() {
        let kind = EntityKind::Event;
        let ctx = MatchContext::new("party", "Luca's birthday party", &kind);
        assert!(force_link_matches(
            &rule(ForceLinkMatcher::Generic {
                pattern: "(?i)birthday".to_string()
            }),
            &ctx
        ));
    }

    #[test]
    fn test_pattern_rule_matches_label_only() {
        let kind = EntityKind::Custom("thing".to_string());
        let ctx = MatchContext::new("Dott. Bianchi", "met Dott. Bianchi", &kind);
        let pattern = PatternRule {
            rule_id: RuleId::new(),
            pattern: "^Dott\\.".to_string(),
            kind: None,
            effect: PatternEffect::SetKind {
                target_kind: EntityKind::Person,
            },
            sequence: 0,
        };
        assert!(pattern_matches(&pattern, &ctx));
    }

    #[test]
    fn test_tokens_within_window_edges() {
        assert!(!tokens_within_window(&[], &toks("a"), 3));
        assert!(tokens_within_window(&toks("a b"), &toks("a b"), 5));
        assert!(!tokens_within_window(&toks("a x x b"), &toks("a b"), 3));
        assert!(tokens_within_window(&toks("a x x b"), &toks("a b"), 4));
    }
}
