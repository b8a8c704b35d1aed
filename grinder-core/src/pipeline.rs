//! Run coordinator
//!
//! Wires the stages together: catalog filter, concurrent discovery on every
//! configured backend, deduplication, confidence merge into the store, scan
//! dispatch on the two pools and the merge of scan outcomes. The store is
//! persisted when the run ends, including when it was cancelled.
//!
//! # Example
//!
//! ```no_run
//! use grinder_core::catalog::Catalog;
//! use grinder_core::config::RunConfig;
//! use grinder_core::pipeline::Pipeline;
//!
//! # async fn example() -> grinder_core::Result<()> {
//! let config = RunConfig::default().apply_env_overrides()?;
//! let catalog = Catalog::load("queries.json")?;
//! let pipeline = Pipeline::new(config)?;
//! let summary = pipeline.run(&catalog).await?;
//! println!("{} hosts, {} failed scans", summary.hosts, summary.failed_scans.len());
//! # Ok(())
//! # }
//! ```

use crate::catalog::Catalog;
use crate::config::RunConfig;
use crate::dedup::HostDeduplicator;
use crate::discovery::{CensysClient, Collector, QueryWarning, SearchBackend, ShodanClient};
use crate::error::{Error, Result};
use crate::resolve::ConfidenceResolver;
use crate::scan::engines::production_registry;
use crate::scan::{EngineRegistry, ScanDispatcher};
use crate::store::HostRecordStore;
use crate::types::{Engine, HostKey, HostRecord, ScanKind, ScanOutcome, ScanStatus};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A backend that took no part in the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisabledBackend {
    /// Backend
    pub engine: Engine,
    /// Missing credentials or the authentication error
    pub reason: String,
}

/// A scan task that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanIssue {
    /// Host the task ran against
    pub key: HostKey,
    /// Kind of scan
    pub kind: ScanKind,
    /// Custom script the task ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Error detail
    pub error: Option<String>,
}

impl ScanIssue {
    fn from_outcome(outcome: &ScanOutcome) -> Self {
        Self {
            key: outcome.task.key,
            kind: outcome.task.kind,
            script: outcome.task.script.clone(),
            error: outcome.error.clone(),
        }
    }
}

/// What a run did, including everything that degraded
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Backends that were not configured or got disabled
    pub disabled_backends: Vec<DisabledBackend>,
    /// Queries degraded to an empty result
    pub warnings: Vec<QueryWarning>,
    /// Queries that ran to completion
    pub queries_run: usize,
    /// Queries never attempted
    pub queries_skipped: usize,
    /// Raw hits across every backend
    pub hits: usize,
    /// Distinct hosts discovered (or rescanned)
    pub hosts: usize,
    /// Records whose content changed
    pub records_changed: usize,
    /// Scan tasks planned
    pub scans_planned: usize,
    /// Scan tasks that succeeded
    pub scans_succeeded: usize,
    /// Scan tasks that failed on every attempt
    pub failed_scans: Vec<ScanIssue>,
    /// Scan tasks that exceeded their deadline
    pub timed_out_scans: Vec<ScanIssue>,
    /// Scan tasks interrupted by cancellation
    pub cancelled_scans: Vec<ScanIssue>,
    /// Hosts whose attribution is ambiguous
    pub ambiguous_hosts: Vec<HostKey>,
    /// The run was cancelled before completing
    pub cancelled: bool,
}

impl RunSummary {
    fn record_outcome(&mut self, outcome: &ScanOutcome) {
        match outcome.status {
            ScanStatus::Success => self.scans_succeeded += 1,
            ScanStatus::Failed => self.failed_scans.push(ScanIssue::from_outcome(outcome)),
            ScanStatus::Timeout => self.timed_out_scans.push(ScanIssue::from_outcome(outcome)),
            ScanStatus::Cancelled => self.cancelled_scans.push(ScanIssue::from_outcome(outcome)),
        }
    }

    /// Number of scan tasks that did not succeed
    pub fn scans_unsuccessful(&self) -> usize {
        self.failed_scans.len() + self.timed_out_scans.len() + self.cancelled_scans.len()
    }
}

/// Stage progress, for front ends that display it
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// A backend finished all its queries
    DiscoveryFinished {
        /// Backend
        engine: Engine,
        /// Hits it returned
        hits: usize,
    },
    /// Hosts were merged into the store
    HostsMerged(usize),
    /// Scan tasks were planned
    ScansPlanned(usize),
    /// A scan task reached a terminal state
    ScanFinished {
        /// Target
        key: HostKey,
        /// Kind of scan
        kind: ScanKind,
        /// Terminal status
        status: ScanStatus,
    },
}

/// Coordinates one run over a shared record store
pub struct Pipeline {
    config: RunConfig,
    backends: Vec<Arc<dyn SearchBackend>>,
    unconfigured: Vec<DisabledBackend>,
    registry: EngineRegistry,
    store: Arc<HostRecordStore>,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<Progress>>,
    persist: bool,
}

impl Pipeline {
    /// Builds a pipeline with the real backends and scan tools
    ///
    /// Backends without credentials are not constructed and are reported as
    /// disabled. The store is loaded from the results file if one exists.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;

        let mut backends: Vec<Arc<dyn SearchBackend>> = Vec::new();
        let mut unconfigured = Vec::new();

        match config.credentials.shodan() {
            Some(key) => backends.push(Arc::new(ShodanClient::new(key)?)),
            None => unconfigured.push(DisabledBackend {
                engine: Engine::Shodan,
                reason: "no API key configured".to_string(),
            }),
        }
        match config.credentials.censys() {
            Some((id, secret)) => backends.push(Arc::new(CensysClient::new(id, secret)?)),
            None => unconfigured.push(DisabledBackend {
                engine: Engine::Censys,
                reason: "no API id/secret configured".to_string(),
            }),
        }

        let store = Arc::new(HostRecordStore::load(config.results_path())?);
        let registry = production_registry(&config);

        let mut pipeline = Self::with_parts(config, backends, registry, store);
        pipeline.unconfigured = unconfigured;
        Ok(pipeline)
    }

    /// Builds a pipeline from explicit parts
    pub fn with_parts(
        config: RunConfig,
        backends: Vec<Arc<dyn SearchBackend>>,
        registry: EngineRegistry,
        store: Arc<HostRecordStore>,
    ) -> Self {
        Self {
            config,
            backends,
            unconfigured: Vec::new(),
            registry,
            store,
            cancel: CancellationToken::new(),
            progress: None,
            persist: true,
        }
    }

    /// Stops discovery and scans when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Reports stage progress on `tx`
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Keeps results in memory only
    pub fn in_memory(mut self) -> Self {
        self.persist = false;
        self
    }

    /// Store the pipeline merges into
    pub fn store(&self) -> &Arc<HostRecordStore> {
        &self.store
    }

    /// Configuration of the run
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn emit(&self, event: Progress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    fn max_results(&self, engine: Engine) -> usize {
        match engine {
            Engine::Shodan => self.config.shodan_max_results,
            Engine::Censys => self.config.censys_max_results,
        }
    }

    fn no_backends(disabled: &[DisabledBackend]) -> Error {
        let reasons: Vec<String> = disabled
            .iter()
            .map(|d| format!("{}: {}", d.engine, d.reason))
            .collect();
        Error::NoBackends(reasons.join("; "))
    }

    /// Full run: discovery, merge, scans
    ///
    /// Only a configuration problem or the absence of any usable backend is
    /// an error; everything else degrades and is reported in the summary.
    pub async fn run(&self, catalog: &Catalog) -> Result<RunSummary> {
        let mut summary = RunSummary {
            disabled_backends: self.unconfigured.clone(),
            ..Default::default()
        };
        if self.backends.is_empty() {
            return Err(Self::no_backends(&summary.disabled_backends));
        }

        let catalog = catalog.filter(&self.config.catalog_filter());
        info!(
            vendors = catalog.len(),
            queries = catalog.query_count(),
            backends = self.backends.len(),
            "run started"
        );

        let collectors: Vec<(Collector, _)> = self
            .backends
            .iter()
            .map(|backend| {
                let engine = backend.engine();
                let collector = Collector::new(Arc::clone(backend), self.max_results(engine))
                    .with_retry(self.config.rate_limit_retry)
                    .with_concurrency(self.config.discovery_concurrency)
                    .with_cancellation(self.cancel.clone());
                (collector, catalog.queries_for(engine))
            })
            .collect();

        let reports = join_all(
            collectors
                .iter()
                .map(|(collector, queries)| collector.run(queries.clone())),
        )
        .await;

        let mut dedup = HostDeduplicator::new();
        for report in reports {
            self.emit(Progress::DiscoveryFinished {
                engine: report.engine,
                hits: report.hits.len(),
            });
            summary.queries_run += report.queries_run;
            summary.queries_skipped += report.queries_skipped;
            summary.cancelled |= report.cancelled;
            summary.warnings.extend(report.warnings);
            if let Some(reason) = report.disabled {
                summary.disabled_backends.push(DisabledBackend {
                    engine: report.engine,
                    reason,
                });
            }
            dedup.extend(report.hits);
        }

        let active = self.backends.len()
            - summary
                .disabled_backends
                .iter()
                .filter(|d| self.backends.iter().any(|b| b.engine() == d.engine))
                .count();
        if active == 0 {
            return Err(Self::no_backends(&summary.disabled_backends));
        }

        summary.hits = dedup.hit_count();
        let groups = dedup.finish();
        summary.hosts = groups.len();

        let resolver = ConfidenceResolver::new(Arc::clone(&self.store));
        summary.records_changed = resolver.apply_groups(&groups);
        self.emit(Progress::HostsMerged(groups.len()));

        let records: Vec<HostRecord> = groups
            .iter()
            .filter_map(|group| self.store.lookup(&group.key))
            .collect();
        summary.ambiguous_hosts = records
            .iter()
            .filter(|r| r.ambiguous)
            .map(|r| r.key)
            .collect();
        info!(
            hits = summary.hits,
            hosts = summary.hosts,
            changed = summary.records_changed,
            ambiguous = summary.ambiguous_hosts.len(),
            "discovery merged"
        );

        if !summary.cancelled && !self.cancel.is_cancelled() {
            self.scan(&records, &catalog, &resolver, &mut summary).await;
        }

        self.finish(summary)
    }

    /// Scan and merge stages only, over the stored records the vendor
    /// allow-list and confidence thresholds still select
    pub async fn rescan(&self, catalog: &Catalog) -> Result<RunSummary> {
        let filter = self.config.catalog_filter();
        let catalog = catalog.filter(&filter);
        let records: Vec<HostRecord> = self
            .store
            .records()
            .into_iter()
            .filter(|record| {
                filter.is_empty()
                    || record.attribution.iter().any(|a| filter.allows_attribution(a))
            })
            .collect();
        let mut summary = RunSummary {
            hosts: records.len(),
            ambiguous_hosts: records
                .iter()
                .filter(|r| r.ambiguous)
                .map(|r| r.key)
                .collect(),
            ..Default::default()
        };
        info!(
            hosts = records.len(),
            stored = self.store.len(),
            "rescan started"
        );

        let resolver = ConfidenceResolver::new(Arc::clone(&self.store));
        self.scan(&records, &catalog, &resolver, &mut summary).await;
        self.finish(summary)
    }

    async fn scan(
        &self,
        records: &[HostRecord],
        catalog: &Catalog,
        resolver: &ConfidenceResolver,
        summary: &mut RunSummary,
    ) {
        if self.config.scan_kinds.is_empty() {
            return;
        }

        let dispatcher = ScanDispatcher::new(self.registry.clone(), &self.config)
            .with_cancellation(self.cancel.clone());
        let tasks = dispatcher.plan(records, catalog);
        summary.scans_planned = tasks.len();
        self.emit(Progress::ScansPlanned(tasks.len()));

        let mut outcomes = dispatcher.submit(tasks);
        while let Some(outcome) = outcomes.recv().await {
            if !outcome.is_success() {
                warn!(
                    host = %outcome.task.key,
                    kind = %outcome.task.kind,
                    status = %outcome.status,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "scan did not succeed"
                );
            }
            if resolver.apply_outcome(&outcome) {
                summary.records_changed += 1;
            }
            summary.record_outcome(&outcome);
            self.emit(Progress::ScanFinished {
                key: outcome.task.key,
                kind: outcome.task.kind,
                status: outcome.status,
            });
        }

        summary.cancelled |= self.cancel.is_cancelled();
        info!(
            planned = summary.scans_planned,
            succeeded = summary.scans_succeeded,
            failed = summary.failed_scans.len(),
            timed_out = summary.timed_out_scans.len(),
            cancelled = summary.cancelled_scans.len(),
            "scans finished"
        );
    }

    fn finish(&self, mut summary: RunSummary) -> Result<RunSummary> {
        summary.cancelled |= self.cancel.is_cancelled();
        if self.persist {
            self.store.save(self.config.results_path())?;
        }
        if summary.cancelled {
            warn!(records = self.store.len(), "run cancelled, partial results kept");
        } else {
            info!(records = self.store.len(), "run finished");
        }
        Ok(summary)
    }
}
