//! Redirect graph between merged entities.
//!
//! A redirect edge points from a merged-away (losing) entity to the entity
//! that absorbed it. Resolution walks edges with a visited set plus a hop
//! limit, so a corrupted map reports an error instead of looping.
//!
//! Resolved heads are memoized. The memo is keyed by the queried id and
//! invalidated by chain head: adding or removing an edge drops every memo
//! entry whose head could have changed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use thiserror::Error;

use crate::entity::EntityId;

/// Default upper bound on chain length.
pub const DEFAULT_HOP_LIMIT: usize = 128;

/// Failures while walking redirect chains.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedirectError {
    /// The walk revisited an id.
    #[error("redirect cycle detected at {0}")]
    Cycle(EntityId),

    /// The walk exceeded the hop limit.
    #[error("redirect chain from {start} exceeded {limit} hops")]
    HopLimit { start: EntityId, limit: usize },
}

/// Follows `next` from `start` until a head is reached.
///
/// Shared by the store's redirect map and by ruleset redirect overrides.
///
/// # Errors
/// Returns [`RedirectError`] on a cycle or when the hop limit is exceeded.
pub fn follow<F>(start: EntityId, hop_limit: usize, mut next: F) -> Result<EntityId, RedirectError>
where
    F: FnMut(EntityId) -> Option<EntityId>,
{
    let mut visited: HashSet<EntityId> = HashSet::new();
    let mut current = start;
    visited.insert(current);
    for _ in 0..hop_limit {
        let Some(target) = next(current) else {
            return Ok(current);
        };
        if !visited.insert(target) {
            return Err(RedirectError::Cycle(target));
        }
        current = target;
    }
    Err(RedirectError::HopLimit {
        start,
        limit: hop_limit,
    })
}

/// Edge map with a memoized resolver.
#[derive(Debug)]
pub struct RedirectMap {
    edges: HashMap<EntityId, EntityId>,
    incoming: HashMap<EntityId, BTreeSet<EntityId>>,
    memo: Mutex<HashMap<EntityId, EntityId>>,
    hop_limit: usize,
}

impl Default for RedirectMap {
    fn default() -> Self {
        Self::with_hop_limit(DEFAULT_HOP_LIMIT)
    }
}

impl RedirectMap {
    /// Creates an empty map with the given hop limit.
    #[must_use]
    pub fn with_hop_limit(hop_limit: usize) -> Self {
        Self {
            edges: HashMap::new(),
            incoming: HashMap::new(),
            memo: Mutex::new(HashMap::new()),
            hop_limit: hop_limit.max(1),
        }
    }

    /// Direct target of `id`, if it was merged away.
    #[must_use]
    pub fn target(&self, id: EntityId) -> Option<EntityId> {
        self.edges.get(&id).copied()
    }

    /// Ids with an edge pointing directly at `id`.
    #[must_use]
    pub fn sources(&self, id: EntityId) -> Vec<EntityId> {
        self.incoming
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every id whose chain passes through `id` (excluding `id`).
    #[must_use]
    pub fn upstream(&self, id: EntityId) -> BTreeSet<EntityId> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            for src in self.sources(cur) {
                if src != id && out.insert(src) {
                    stack.push(src);
                }
            }
        }
        out
    }

    /// Number of edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if no entity has been redirected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Resolves `id` to the head of its chain.
    ///
    /// # Errors
    /// Returns [`RedirectError`] if the map is corrupted.
    pub fn resolve(&self, id: EntityId) -> Result<EntityId, RedirectError> {
        if let Ok(memo) = self.memo.lock() {
            if let Some(head) = memo.get(&id) {
                return Ok(*head);
            }
        }

        let head = follow(id, self.hop_limit, |cur| self.edges.get(&cur).copied())?;

        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(id, head);
        }
        Ok(head)
    }

    /// Returns true if adding `losing -> winning` would close a cycle.
    ///
    /// `losing` is expected to be a head, so the edge closes a cycle exactly
    /// when the chain from `winning` ends at `losing`.
    #[must_use]
    pub fn would_cycle(&self, losing: EntityId, winning: EntityId) -> bool {
        if losing == winning {
            return true;
        }
        match self.resolve(winning) {
            Ok(head) => head == losing,
            Err(_) => true,
        }
    }

    /// Inserts `losing -> winning`.
    ///
    /// The caller guarantees `losing` has no outgoing edge.
    ///
    /// # Errors
    /// Returns [`RedirectError::Cycle`] if the edge would close a cycle.
    pub fn insert(&mut self, losing: EntityId, winning: EntityId) -> Result<(), RedirectError> {
        if self.would_cycle(losing, winning) {
            return Err(RedirectError::Cycle(losing));
        }
        self.edges.insert(losing, winning);
        self.incoming.entry(winning).or_default().insert(losing);
        // Everything that used to stop at `losing` now continues past it.
        self.invalidate_head(losing);
        Ok(())
    }

    /// Removes the edge leaving `losing`, returning its old target.
    pub fn remove(&mut self, losing: EntityId) -> Option<EntityId> {
        let old_head = self.resolve(losing).ok();
        let target = self.edges.remove(&losing)?;
        if let Some(set) = self.incoming.get_mut(&target) {
            set.remove(&losing);
            if set.is_empty() {
                self.incoming.remove(&target);
            }
        }
        match old_head {
            Some(head) => self.invalidate_head(head),
            None => self.clear_memo(),
        }
        Some(target)
    }

    /// Drops memo entries that resolved to `head`.
    pub fn invalidate_head(&self, head: EntityId) {
        if let Ok(mut memo) = self.memo.lock() {
            memo.retain(|_, h| *h != head);
        }
    }

    fn clear_memo(&self) {
        if let Ok(mut memo) = self.memo.lock() {
            memo.clear();
        }
    }

    #[cfg(test)]
    fn memo_len(&self) -> usize {
        self.memo.lock().map(|m| m.len()).unwrap_or(0)
    }
}
