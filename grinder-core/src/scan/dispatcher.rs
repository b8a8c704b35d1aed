//! Scan planning and routing to the two worker pools

use super::pool::{PoolSettings, WorkerPool};
use super::EngineRegistry;
use crate::catalog::Catalog;
use crate::config::RunConfig;
use crate::ip_utils::{classify_ip, AddressScope};
use crate::types::{HostRecord, ScanContext, ScanKind, ScanOutcome, ScanTask, WorkerClass};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Capacity of the outcome channel returned by [`ScanDispatcher::submit`]
const OUTCOME_BUFFER: usize = 100;

/// Plans scan tasks and runs them on an nmap-class and a vulners-class pool
///
/// # Example
///
/// ```no_run
/// use grinder_core::config::RunConfig;
/// use grinder_core::scan::{engines::production_registry, ScanDispatcher};
/// # use grinder_core::{catalog::Catalog, types::HostRecord};
///
/// # async fn example(records: Vec<HostRecord>, catalog: Catalog) {
/// let config = RunConfig::default();
/// let dispatcher = ScanDispatcher::new(production_registry(&config), &config);
/// let tasks = dispatcher.plan(&records, &catalog);
/// let mut outcomes = dispatcher.submit(tasks);
/// while let Some(outcome) = outcomes.recv().await {
///     println!("{} {} -> {}", outcome.task.key, outcome.task.kind, outcome.status);
/// }
/// # }
/// ```
pub struct ScanDispatcher {
    registry: Arc<EngineRegistry>,
    settings: Arc<PoolSettings>,
    nmap_workers: usize,
    vulners_workers: usize,
    kinds: BTreeSet<ScanKind>,
    skip_non_global: bool,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl ScanDispatcher {
    /// Creates a dispatcher with pool sizes, kinds and timeouts from `config`
    pub fn new(registry: EngineRegistry, config: &RunConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            settings: Arc::new(PoolSettings::from_config(config)),
            nmap_workers: config.nmap_workers,
            vulners_workers: config.vulners_workers,
            kinds: config.scan_kinds.clone(),
            skip_non_global: config.skip_non_global,
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stops workers when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Enabled scan kinds
    pub fn kinds(&self) -> &BTreeSet<ScanKind> {
        &self.kinds
    }

    fn next_task(&self, record: &HostRecord, kind: ScanKind, context: &ScanContext) -> ScanTask {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ScanTask::new(id, record.key, kind).with_context(context.clone())
    }

    /// Builds the tasks for `records`
    ///
    /// Every record gets one task per enabled built-in kind. Custom script
    /// kinds produce one task per distinct script named by the catalog
    /// entries of the record's winning attribution.
    pub fn plan(&self, records: &[HostRecord], catalog: &Catalog) -> Vec<ScanTask> {
        let mut tasks = Vec::new();
        let mut skipped = 0usize;

        for record in records {
            if self.skip_non_global {
                let scope = classify_ip(&record.key.ip);
                if scope != AddressScope::Global {
                    debug!(host = %record.key, %scope, "not scanning non-global address");
                    skipped += 1;
                    continue;
                }
            }

            let primary = record.primary();
            let context = ScanContext {
                vendor: primary.map(|a| a.vendor.clone()),
                product: primary.map(|a| a.product.clone()),
                transport: record.transport().map(str::to_string),
                country: record.country().map(str::to_string),
            };

            for kind in &self.kinds {
                match kind {
                    ScanKind::NseScript | ScanKind::PythonScript => {
                        let scripts: BTreeSet<&str> = record
                            .attribution
                            .iter()
                            .filter_map(|a| catalog.scripts_for(&a.vendor, &a.product))
                            .filter_map(|s| match kind {
                                ScanKind::NseScript => s.nse_script.as_deref(),
                                _ => s.py_script.as_deref(),
                            })
                            .collect();
                        for script in scripts {
                            tasks.push(self.next_task(record, *kind, &context).with_script(script));
                        }
                    }
                    _ => tasks.push(self.next_task(record, *kind, &context)),
                }
            }
        }

        info!(
            hosts = records.len(),
            tasks = tasks.len(),
            skipped_non_global = skipped,
            "scan plan ready"
        );
        tasks
    }

    /// Runs `tasks` on the pools and returns their outcomes as they complete
    ///
    /// Every task yields exactly one outcome; the channel closes once all of
    /// them were delivered. Must be called from within a tokio runtime.
    pub fn submit(&self, tasks: Vec<ScanTask>) -> mpsc::Receiver<ScanOutcome> {
        let (tx, rx) = mpsc::channel(OUTCOME_BUFFER);

        let nmap = WorkerPool::spawn(
            WorkerClass::Nmap,
            self.nmap_workers,
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
            tx.clone(),
            self.cancel.clone(),
        );
        let vulners = WorkerPool::spawn(
            WorkerClass::Vulners,
            self.vulners_workers,
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
            tx,
            self.cancel.clone(),
        );

        tokio::spawn(async move {
            let total = tasks.len();
            for task in tasks {
                let pool = match task.worker_class {
                    WorkerClass::Nmap => &nmap,
                    WorkerClass::Vulners => &vulners,
                };
                if let Err(e) = pool.submit(task).await {
                    debug!(error = %e, "stopped feeding scan tasks");
                    break;
                }
            }
            debug!(total, "all scan tasks queued");
            nmap.join().await;
            vulners.join().await;
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanEngine;
    use crate::types::{
        Attribution, Confidence, Engine, HostAttributes, HostKey, ScanFindings, ScanStatus,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    const CATALOG: &str = r#"[
        {"vendor": "Acme", "product": "Widget", "vendor_confidence": "certain",
         "shodan_queries": [{"query": "widget", "query_confidence": "certain"}],
         "scripts": {"nse_script": "widget.nse", "py_script": "widget.py"}},
        {"vendor": "Globex", "product": "Controller", "vendor_confidence": "firm",
         "shodan_queries": [{"query": "globex", "query_confidence": "firm"}]}
    ]"#;

    fn record(ip: &str, vendor: &str, product: &str) -> HostRecord {
        let mut record = HostRecord::new(HostKey::new(ip.parse().unwrap(), 443));
        record.attribution.push(Attribution {
            vendor: vendor.into(),
            product: product.into(),
            engine: Engine::Shodan,
            query: "q".into(),
            query_confidence: Confidence::Certain,
            vendor_confidence: Confidence::Certain,
        });
        record.sources.insert(
            Engine::Shodan,
            vec![HostAttributes {
                transport: Some("tcp".into()),
                ..Default::default()
            }],
        );
        record
    }

    fn config(kinds: &[ScanKind]) -> RunConfig {
        RunConfig {
            scan_kinds: kinds.iter().copied().collect(),
            nmap_workers: 2,
            vulners_workers: 2,
            ..Default::default()
        }
    }

    struct EchoEngine;

    #[async_trait]
    impl ScanEngine for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }

        async fn scan(&self, _task: &ScanTask) -> crate::error::Result<ScanFindings> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(ScanFindings::default())
        }
    }

    #[test]
    fn test_plan_builtin_kinds() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let dispatcher = ScanDispatcher::new(
            EngineRegistry::new(),
            &config(&[ScanKind::PortService, ScanKind::Vulnerability]),
        );
        let records = vec![
            record("8.8.8.8", "Acme", "Widget"),
            record("1.1.1.1", "Globex", "Controller"),
        ];

        let tasks = dispatcher.plan(&records, &catalog);
        assert_eq!(tasks.len(), 4);
        let ids: BTreeSet<u64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(tasks[0].worker_class, WorkerClass::Nmap);
        assert_eq!(tasks[1].worker_class, WorkerClass::Vulners);
        assert_eq!(tasks[0].context.vendor.as_deref(), Some("Acme"));
        assert_eq!(tasks[0].context.transport.as_deref(), Some("tcp"));
    }

    #[test]
    fn test_plan_custom_scripts_only_for_attributed_entries() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let dispatcher = ScanDispatcher::new(
            EngineRegistry::new(),
            &config(&[ScanKind::NseScript, ScanKind::PythonScript]),
        );
        let records = vec![
            record("8.8.8.8", "Acme", "Widget"),
            record("1.1.1.1", "Globex", "Controller"),
        ];

        let tasks = dispatcher.plan(&records, &catalog);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.key.ip.to_string() == "8.8.8.8"));
        let nse = tasks.iter().find(|t| t.kind == ScanKind::NseScript).unwrap();
        assert_eq!(nse.script.as_deref(), Some("widget.nse"));
        assert_eq!(nse.worker_class, WorkerClass::Nmap);
        let py = tasks.iter().find(|t| t.kind == ScanKind::PythonScript).unwrap();
        assert_eq!(py.script.as_deref(), Some("widget.py"));
        assert_eq!(py.worker_class, WorkerClass::Vulners);
    }

    #[test]
    fn test_plan_skips_non_global_when_asked() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let mut cfg = config(&[ScanKind::PortService]);
        cfg.skip_non_global = true;
        let dispatcher = ScanDispatcher::new(EngineRegistry::new(), &cfg);
        let records = vec![
            record("8.8.8.8", "Acme", "Widget"),
            record("192.168.0.10", "Acme", "Widget"),
        ];
        let tasks = dispatcher.plan(&records, &catalog);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].key.ip.to_string(), "8.8.8.8");
    }

    #[test]
    fn test_plan_without_kinds_is_empty() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let dispatcher = ScanDispatcher::new(EngineRegistry::new(), &config(&[]));
        assert!(dispatcher
            .plan(&[record("8.8.8.8", "Acme", "Widget")], &catalog)
            .is_empty());
    }

    #[tokio::test]
    async fn test_submit_routes_and_reports_every_task() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let registry = EngineRegistry::new()
            .with(ScanKind::PortService, Arc::new(EchoEngine))
            .with(ScanKind::Vulnerability, Arc::new(EchoEngine));
        let dispatcher = ScanDispatcher::new(
            registry,
            &config(&[ScanKind::PortService, ScanKind::Vulnerability]),
        );
        let records: Vec<HostRecord> = (1..=10)
            .map(|i| record(&format!("8.8.4.{}", i), "Acme", "Widget"))
            .collect();

        let tasks = dispatcher.plan(&records, &catalog);
        let expected: BTreeSet<u64> = tasks.iter().map(|t| t.id).collect();
        let mut rx = dispatcher.submit(tasks);

        let mut seen = BTreeSet::new();
        while let Some(outcome) = rx.recv().await {
            assert_eq!(outcome.status, ScanStatus::Success);
            assert!(seen.insert(outcome.task.id), "duplicate outcome");
        }
        assert_eq!(seen, expected);
    }
}
