//! Confidence-based attribution and record merging
//!
//! Every query that matched a host makes a claim on it. The winning
//! attribution is the set of claims with the highest
//! `(query_confidence, vendor_confidence)` pair; ties are kept side by side
//! and flagged as ambiguous when they disagree on vendor or product.
//!
//! Claims are stored as a sorted set, so the result does not depend on the
//! order in which backends or queries returned hits. Merging the same group
//! or outcome twice leaves the record content unchanged.

use crate::dedup::HostGroup;
use crate::store::HostRecordStore;
use crate::types::{Attribution, HostRecord, ScanOutcome, ScanStatusEntry, ScriptRun};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Batch size from which `apply_groups` spreads merges over threads
const PARALLEL_MERGE_MIN: usize = 256;

/// Winning claims of a host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Claims sharing the highest rank, sorted
    pub winners: Vec<Attribution>,
    /// True when the winners name more than one vendor/product pair
    pub ambiguous: bool,
}

/// Picks the highest-ranked claims
///
/// ```
/// use grinder_core::resolve::resolve_claims;
///
/// let resolution = resolve_claims(&[]);
/// assert!(resolution.winners.is_empty());
/// assert!(!resolution.ambiguous);
/// ```
pub fn resolve_claims(claims: &[Attribution]) -> Resolution {
    let Some(best) = claims.iter().map(Attribution::rank).max() else {
        return Resolution::default();
    };

    let winners: BTreeSet<Attribution> = claims
        .iter()
        .filter(|claim| claim.rank() == best)
        .cloned()
        .collect();

    let identities: BTreeSet<(&str, &str)> = winners
        .iter()
        .map(|claim| (claim.vendor.as_str(), claim.product.as_str()))
        .collect();
    let ambiguous = identities.len() > 1;

    Resolution {
        winners: winners.into_iter().collect(),
        ambiguous,
    }
}

fn push_distinct<T: PartialEq>(target: &mut Vec<T>, items: impl IntoIterator<Item = T>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

/// Folds a group of discovery hits into the existing record for its key
pub fn merge_group(existing: Option<&HostRecord>, group: &HostGroup) -> HostRecord {
    let mut record = existing
        .cloned()
        .unwrap_or_else(|| HostRecord::new(group.key));

    let mut claims: BTreeSet<Attribution> = record.claims.drain(..).collect();
    claims.extend(group.claims());
    record.claims = claims.into_iter().collect();

    for (engine, attributes) in group.sources() {
        push_distinct(record.sources.entry(engine).or_default(), attributes);
    }
    push_distinct(&mut record.banners, group.banners());

    let resolution = resolve_claims(&record.claims);
    record.attribution = resolution.winners;
    record.ambiguous = resolution.ambiguous;
    record.last_updated = Utc::now();
    record
}

/// Folds a scan outcome into the record for its key
///
/// Findings are only absorbed from successful outcomes; the status of the
/// kind always reflects the latest outcome. Custom script outcomes are kept
/// per script name, so several scripts of one kind never overwrite each other.
pub fn merge_outcome(existing: Option<&HostRecord>, outcome: &ScanOutcome) -> HostRecord {
    let mut record = existing
        .cloned()
        .unwrap_or_else(|| HostRecord::new(outcome.task.key));
    let kind = outcome.task.kind;
    let status = ScanStatusEntry {
        status: outcome.status,
        attempts: outcome.attempts,
        error: outcome.error.clone(),
    };
    let findings = outcome
        .findings
        .as_ref()
        .filter(|_| outcome.is_success())
        .cloned();

    match outcome.task.script.as_deref() {
        Some(script) => {
            let run = record
                .scripts
                .entry(kind)
                .or_default()
                .entry(script.to_string())
                .or_insert_with(|| ScriptRun {
                    status: status.clone(),
                    output: None,
                });
            run.status = status;
            if let Some(mut findings) = findings {
                if let Some(output) = findings.script_output.take() {
                    run.output = Some(output);
                }
                if !findings.is_empty() {
                    record.findings.entry(kind).or_default().absorb(findings);
                }
            }
        }
        None => {
            if let Some(findings) = findings {
                record.findings.entry(kind).or_default().absorb(findings);
            }
            record.scan_status.insert(kind, status);
        }
    }
    record.last_updated = Utc::now();
    record
}

/// Applies merges to a shared store
#[derive(Debug, Clone)]
pub struct ConfidenceResolver {
    store: Arc<HostRecordStore>,
}

impl ConfidenceResolver {
    /// Creates a resolver writing to `store`
    pub fn new(store: Arc<HostRecordStore>) -> Self {
        Self { store }
    }

    /// Store the resolver writes to
    pub fn store(&self) -> &Arc<HostRecordStore> {
        &self.store
    }

    /// Merges a discovery group; returns true if the record changed
    pub fn apply_group(&self, group: &HostGroup) -> bool {
        let changed = self
            .store
            .update(group.key, |current| merge_group(current, group));
        if changed {
            if let Some(record) = self.store.lookup(&group.key) {
                if record.ambiguous {
                    warn!(
                        host = %group.key,
                        claims = record.attribution.len(),
                        "ambiguous attribution"
                    );
                }
            }
        }
        changed
    }

    /// Merges every group, returning the number of records that changed
    ///
    /// Groups carry distinct keys, so large batches are split across scoped
    /// threads that update the store concurrently.
    pub fn apply_groups(&self, groups: &[HostGroup]) -> usize {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        if threads < 2 || groups.len() < PARALLEL_MERGE_MIN {
            return groups.iter().filter(|group| self.apply_group(group)).count();
        }

        let chunk_size = groups.len().div_ceil(threads);
        debug!(groups = groups.len(), threads, "merging groups in parallel");
        std::thread::scope(|scope| {
            let workers: Vec<_> = groups
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || chunk.iter().filter(|group| self.apply_group(group)).count())
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .sum()
        })
    }

    /// Merges a scan outcome; returns true if the record changed
    pub fn apply_outcome(&self, outcome: &ScanOutcome) -> bool {
        debug!(
            host = %outcome.task.key,
            kind = %outcome.task.kind,
            status = %outcome.status,
            "merging scan outcome"
        );
        self.store
            .update(outcome.task.key, |current| merge_outcome(current, outcome))
    }
}
