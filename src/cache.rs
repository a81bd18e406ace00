//! Content-addressed result cache.
//!
//! Entries are keyed by [`Fingerprint`]. The cache is unbounded unless the
//! configuration sets an entry or byte limit, in which case the least
//! recently used entries are evicted first.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::data::DataCollection;
use crate::element::ElementId;
use crate::fingerprint::Fingerprint;
use crate::task::Stack;

/// One stored result.
#[derive(Debug, Clone)]
pub struct CachedResult {
    fingerprint: Fingerprint,
    element: ElementId,
    data: DataCollection,
    stack: Option<Arc<Stack>>,
    bytes: u64,
    last_used: u64,
}

impl CachedResult {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn data(&self) -> &DataCollection {
        &self.data
    }

    /// Stack of the task that produced the entry, kept for debugging.
    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_deref()
    }

    pub fn needs_post_graph_handling(&self) -> bool {
        self.data.needs_post_graph_handling()
    }
}

/// What a store call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// The fingerprint was already present with equal content.
    Unchanged,
    /// The fingerprint was present with different content, which was
    /// replaced.
    Overwritten,
    Disabled,
}

pub struct ResultCache {
    config: CacheConfig,
    entries: HashMap<Fingerprint, CachedResult>,
    total_bytes: u64,
    clock: u64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            total_bytes: 0,
            clock: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Looks up an entry and marks it as recently used. The returned
    /// collection shares its items with the stored one, so a concurrent
    /// flush never invalidates it.
    pub fn get(&mut self, fingerprint: &Fingerprint) -> Option<DataCollection> {
        if !self.config.enabled {
            return None;
        }

        self.clock += 1;
        match self.entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.last_used = self.clock;
                trace!(%fingerprint, "cache hit");
                Some(entry.data.clone())
            }
            None => {
                trace!(%fingerprint, "cache miss");
                None
            }
        }
    }

    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<&CachedResult> {
        self.entries.get(fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn store(
        &mut self,
        fingerprint: Fingerprint,
        element: ElementId,
        data: DataCollection,
        stack: Option<Arc<Stack>>,
    ) -> StoreOutcome {
        if !self.config.enabled {
            return StoreOutcome::Disabled;
        }

        self.clock += 1;

        let existing = self
            .entries
            .get(&fingerprint)
            .map(|entry| entry.data.content_hash());

        let outcome = match existing {
            Some(hash) if hash == data.content_hash() => {
                if let Some(entry) = self.entries.get_mut(&fingerprint) {
                    entry.last_used = self.clock;
                }
                return StoreOutcome::Unchanged;
            }
            Some(_) => {
                // A unit is expected to be pure for its fingerprint. The new
                // value still wins.
                warn!(
                    %fingerprint,
                    %element,
                    "cache inconsistency: different content stored for an existing fingerprint"
                );
                self.remove(&fingerprint);
                StoreOutcome::Overwritten
            }
            None => StoreOutcome::Inserted,
        };

        let bytes = data.size_hint() as u64;
        self.total_bytes += bytes;
        self.entries.insert(
            fingerprint,
            CachedResult {
                fingerprint,
                element,
                data,
                stack,
                bytes,
                last_used: self.clock,
            },
        );

        self.evict(fingerprint);
        outcome
    }

    /// Drops every entry produced by the given unit. Returns how many went.
    pub fn clean_element(&mut self, element: ElementId) -> usize {
        let doomed: Vec<Fingerprint> = self
            .entries
            .values()
            .filter(|entry| entry.element == element)
            .map(|entry| entry.fingerprint)
            .collect();

        for fingerprint in &doomed {
            self.remove(fingerprint);
        }

        debug!(%element, removed = doomed.len(), "cleaned cache entries");
        doomed.len()
    }

    pub fn clear(&mut self) {
        debug!(entries = self.entries.len(), "clearing result cache");
        self.entries.clear();
        self.total_bytes = 0;
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_count_for(&self, element: ElementId) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.element == element)
            .count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CachedResult> {
        let entry = self.entries.remove(fingerprint)?;
        self.total_bytes -= entry.bytes;
        Some(entry)
    }

    fn over_budget(&self) -> bool {
        let entries = self
            .config
            .max_entries
            .is_some_and(|max| self.entries.len() > max);
        let bytes = self
            .config
            .max_bytes
            .is_some_and(|max| self.total_bytes > max);

        entries || bytes
    }

    /// Evicts least recently used entries until the bounds hold, never
    /// touching `keep`.
    fn evict(&mut self, keep: Fingerprint) {
        let mut evicted = 0usize;

        while self.over_budget() {
            let victim = self
                .entries
                .values()
                .filter(|entry| entry.fingerprint != keep)
                .min_by_key(|entry| entry.last_used)
                .map(|entry| entry.fingerprint);

            match victim {
                Some(victim) => {
                    self.remove(&victim);
                    evicted += 1;
                }
                None => break,
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "evicted cache entries");
        }
    }
}
