//! Deep scanning of discovered hosts
//!
//! Scanning is organised around three pieces:
//!
//! - [`ScanEngine`]: one capability per [`ScanKind`] (port/service scan,
//!   vulnerability lookup, TLS analysis, custom scripts). Production engines
//!   wrap external tools, tests plug in fakes.
//! - [`WorkerPool`]: a bounded queue drained by a fixed number of long-lived
//!   workers that apply timeout, retry and cancellation to every task.
//! - [`ScanDispatcher`]: plans tasks for host records and routes them to the
//!   nmap-class or vulners-class pool.

pub mod dispatcher;
pub mod engines;
pub mod pool;
pub mod process;

pub use dispatcher::ScanDispatcher;
pub use engines::{NmapEngine, ScriptEngine, TlsEngine, VulnersEngine};
pub use pool::{PoolSettings, WorkerPool};
pub use process::{CommandOutput, CommandRunner};

use crate::error::Result;
use crate::types::{ScanFindings, ScanKind, ScanTask};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A scan capability
///
/// Implementations must release every resource they hold when the returned
/// future is dropped: pools enforce timeouts and cancellation by dropping it.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Short engine name used in logs
    fn name(&self) -> &str;

    /// Scans one host
    async fn scan(&self, task: &ScanTask) -> Result<ScanFindings>;
}

/// Engines available to a run, one per scan kind
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<ScanKind, Arc<dyn ScanEngine>>,
}

impl EngineRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `engine` for `kind`, replacing any previous one
    pub fn with(mut self, kind: ScanKind, engine: Arc<dyn ScanEngine>) -> Self {
        self.register(kind, engine);
        self
    }

    /// Registers `engine` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: ScanKind, engine: Arc<dyn ScanEngine>) {
        self.engines.insert(kind, engine);
    }

    /// Engine for `kind`
    pub fn get(&self, kind: ScanKind) -> Option<&Arc<dyn ScanEngine>> {
        self.engines.get(&kind)
    }

    /// Returns true if an engine is registered for `kind`
    pub fn supports(&self, kind: ScanKind) -> bool {
        self.engines.contains_key(&kind)
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<(&ScanKind, &str)> =
            self.engines.iter().map(|(k, e)| (k, e.name())).collect();
        kinds.sort();
        f.debug_map().entries(kinds).finish()
    }
}
