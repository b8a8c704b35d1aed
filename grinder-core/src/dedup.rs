//! Grouping of raw discovery hits by host identity
//!
//! The deduplicator is a pure aggregation step: it never drops a hit and never
//! picks between conflicting attributes. Every hit for a `(ip, port)` ends up
//! in the same [`HostGroup`], in arrival order, and the resolver decides what
//! the merged record looks like.
//!
//! # Example
//!
//! ```
//! use grinder_core::dedup::HostDeduplicator;
//!
//! let mut dedup = HostDeduplicator::new();
//! assert!(dedup.is_empty());
//! let groups = dedup.finish();
//! assert!(groups.is_empty());
//! ```

use crate::types::{Attribution, Engine, HostAttributes, HostKey, RawHit};
use std::collections::{BTreeMap, BTreeSet};

/// All hits observed for one host key
#[derive(Debug, Clone)]
pub struct HostGroup {
    /// Host identity
    pub key: HostKey,
    /// Every hit for the key, in arrival order
    pub hits: Vec<RawHit>,
}

impl HostGroup {
    /// Creates an empty group
    pub fn new(key: HostKey) -> Self {
        Self {
            key,
            hits: Vec::new(),
        }
    }

    /// Distinct vendor/product claims made by the matching queries
    pub fn claims(&self) -> Vec<Attribution> {
        let set: BTreeSet<Attribution> = self
            .hits
            .iter()
            .map(|hit| Attribution::from_query(&hit.query))
            .collect();
        set.into_iter().collect()
    }

    /// Backends that reported the host
    pub fn engines(&self) -> BTreeSet<Engine> {
        self.hits.iter().map(|hit| hit.engine).collect()
    }

    /// Distinct banners, first-seen order
    pub fn banners(&self) -> Vec<String> {
        let mut banners: Vec<String> = Vec::new();
        for banner in self.hits.iter().filter_map(|hit| hit.attributes.banner.as_ref()) {
            if !banners.contains(banner) {
                banners.push(banner.clone());
            }
        }
        banners
    }

    /// Distinct attribute sets per backend, first-seen order
    pub fn sources(&self) -> BTreeMap<Engine, Vec<HostAttributes>> {
        let mut sources: BTreeMap<Engine, Vec<HostAttributes>> = BTreeMap::new();
        for hit in &self.hits {
            let list = sources.entry(hit.engine).or_default();
            if !list.contains(&hit.attributes) {
                list.push(hit.attributes.clone());
            }
        }
        sources
    }
}

/// Accumulates hits from any number of collectors
#[derive(Debug, Default)]
pub struct HostDeduplicator {
    groups: BTreeMap<HostKey, HostGroup>,
    hits: usize,
}

impl HostDeduplicator {
    /// Creates an empty deduplicator
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one hit
    pub fn push(&mut self, hit: RawHit) {
        self.hits += 1;
        self.groups
            .entry(hit.key)
            .or_insert_with(|| HostGroup::new(hit.key))
            .hits
            .push(hit);
    }

    /// Adds every hit of an iterator
    pub fn extend(&mut self, hits: impl IntoIterator<Item = RawHit>) {
        for hit in hits {
            self.push(hit);
        }
    }

    /// Number of hits pushed so far
    pub fn hit_count(&self) -> usize {
        self.hits
    }

    /// Number of distinct host keys so far
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if no hit was pushed
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Consumes the deduplicator, returning groups ordered by host key
    pub fn finish(self) -> Vec<HostGroup> {
        self.groups.into_values().collect()
    }
}
