//! Core data types for discovery hits, scan work and merged host records
//!
//! This module defines the data structures that flow through the pipeline:
//! catalog queries, raw discovery hits keyed by [`HostKey`], scan tasks and
//! their outcomes, and the merged [`HostRecord`] that is persisted.
//!
//! # Examples
//!
//! ```
//! use grinder_core::types::{Confidence, HostKey, HostRecord};
//!
//! assert!(Confidence::Tentative < Confidence::Firm);
//! assert!(Confidence::Firm < Confidence::Certain);
//!
//! let key = HostKey::new("203.0.113.7".parse().unwrap(), 443);
//! let record = HostRecord::new(key);
//! assert_eq!(record.key.to_string(), "203.0.113.7:443");
//! assert!(record.attribution.is_empty());
//! ```

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Ordered confidence level attached to vendors and to individual queries
///
/// The derive order gives the total order `Tentative < Firm < Certain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Weak signal, likely to produce false positives
    Tentative,
    /// Reliable signal
    Firm,
    /// Identifies the product unambiguously
    Certain,
}

impl Confidence {
    /// All levels, lowest first
    pub const ALL: [Confidence; 3] = [Confidence::Tentative, Confidence::Firm, Confidence::Certain];

    /// Lowercase name used in catalog files
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Tentative => "tentative",
            Confidence::Firm => "firm",
            Confidence::Certain => "certain",
        }
    }
}

impl FromStr for Confidence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tentative" => Ok(Confidence::Tentative),
            "firm" => Ok(Confidence::Firm),
            "certain" => Ok(Confidence::Certain),
            other => Err(Error::config(format!(
                "invalid confidence level '{}' (expected tentative, firm or certain)",
                other
            ))),
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Shodan host search
    Shodan,
    /// Censys hosts search (v2)
    Censys,
}

impl Engine {
    /// Lowercase engine name
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Shodan => "shodan",
            Engine::Censys => "censys",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Custom script pair attached to a catalog entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomScripts {
    /// Script for the port/service (nmap-class) worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nse_script: Option<String>,

    /// Script for the API-scan (vulners-class) worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub py_script: Option<String>,
}

impl CustomScripts {
    /// Returns true if neither script is set
    pub fn is_empty(&self) -> bool {
        self.nse_script.is_none() && self.py_script.is_none()
    }
}

/// A single discovery query from the catalog
///
/// Queries are immutable once loaded and shared as `Arc<Query>` by every hit
/// they produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Vendor the query identifies
    pub vendor: String,

    /// Product the query identifies
    pub product: String,

    /// Backend the query string is written for
    pub engine: Engine,

    /// Engine-specific query string
    pub query: String,

    /// Confidence of this query
    pub query_confidence: Confidence,

    /// Confidence of the vendor entry the query belongs to
    pub vendor_confidence: Confidence,

    /// Custom scripts of the vendor entry
    #[serde(default)]
    pub scripts: CustomScripts,
}

/// Vendor/product entry of the catalog with its ordered queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorEntry {
    /// Vendor name
    pub vendor: String,
    /// Product name
    pub product: String,
    /// Vendor confidence, independent of the queries' confidences
    pub vendor_confidence: Confidence,
    /// Queries in file order (Shodan queries first, then Censys)
    pub queries: Vec<Arc<Query>>,
    /// Custom scripts for hosts attributed to this entry
    pub scripts: CustomScripts,
}

/// Deduplication identity of a discovered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostKey {
    /// Host address
    pub ip: IpAddr,
    /// Service port
    pub port: u16,
}

impl HostKey {
    /// Creates a new HostKey
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Geolocation reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// Longitude
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Country name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// City name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// Raw attributes a backend reported for a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostAttributes {
    /// Service banner or response text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    /// Product string reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,

    /// Version string reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Transport protocol (tcp/udp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    /// Application protocol or crawler module (e.g. "https", "modbus")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Hostnames associated with the address
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    /// Owning organization or autonomous system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    /// Geolocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Vulnerability identifiers reported by the backend
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<String>,

    /// CPE identifiers reported by the backend
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpes: Vec<String>,
}

/// One discovery result, produced once per backend match
#[derive(Debug, Clone)]
pub struct RawHit {
    /// Address of the service
    pub key: HostKey,
    /// Backend that produced the hit
    pub engine: Engine,
    /// Attributes as reported by the backend
    pub attributes: HostAttributes,
    /// Query that matched
    pub query: Arc<Query>,
}

/// Vendor/product claim of a query on a host
///
/// Field order drives the derived `Ord`, used to keep co-attributions in a
/// deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Attribution {
    /// Vendor name
    pub vendor: String,
    /// Product name
    pub product: String,
    /// Backend the matching query ran on
    pub engine: Engine,
    /// Query string that matched
    pub query: String,
    /// Confidence of the matching query
    pub query_confidence: Confidence,
    /// Confidence of the vendor entry
    pub vendor_confidence: Confidence,
}

impl Attribution {
    /// Builds the claim a query makes on every host it matches
    pub fn from_query(query: &Query) -> Self {
        Self {
            vendor: query.vendor.clone(),
            product: query.product.clone(),
            engine: query.engine,
            query: query.query.clone(),
            query_confidence: query.query_confidence,
            vendor_confidence: query.vendor_confidence,
        }
    }

    /// Ranking key: query confidence first, vendor confidence second
    pub fn rank(&self) -> (Confidence, Confidence) {
        (self.query_confidence, self.vendor_confidence)
    }
}

/// Category of deep inspection performed on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Port and service scan
    PortService,
    /// Vulnerability lookup
    Vulnerability,
    /// TLS/SSL analysis
    Tls,
    /// User NSE script on the port/service worker
    NseScript,
    /// User Python script on the API-scan worker
    PythonScript,
}

impl ScanKind {
    /// Worker pool that executes this kind
    pub fn worker_class(&self) -> WorkerClass {
        match self {
            ScanKind::PortService | ScanKind::Tls | ScanKind::NseScript => WorkerClass::Nmap,
            ScanKind::Vulnerability | ScanKind::PythonScript => WorkerClass::Vulners,
        }
    }

    /// Returns true for user-provided script kinds
    pub fn is_custom_script(&self) -> bool {
        matches!(self, ScanKind::NseScript | ScanKind::PythonScript)
    }

    /// Snake-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::PortService => "port_service",
            ScanKind::Vulnerability => "vulnerability",
            ScanKind::Tls => "tls",
            ScanKind::NseScript => "nse_script",
            ScanKind::PythonScript => "python_script",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "port_service" | "nmap" | "ports" => Ok(ScanKind::PortService),
            "vulnerability" | "vulners" => Ok(ScanKind::Vulnerability),
            "tls" | "ssl" => Ok(ScanKind::Tls),
            "nse_script" | "nse" => Ok(ScanKind::NseScript),
            "python_script" | "py_script" | "py" => Ok(ScanKind::PythonScript),
            other => Err(Error::config(format!("unknown scan kind '{}'", other))),
        }
    }
}

/// Worker pool class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    /// Port/service, TLS and NSE scans
    Nmap,
    /// Vulnerability lookups and API-scan scripts
    Vulners,
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerClass::Nmap => f.write_str("nmap"),
            WorkerClass::Vulners => f.write_str("vulners"),
        }
    }
}

/// Host facts handed to scan engines alongside the address
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanContext {
    /// Attributed vendor
    pub vendor: Option<String>,
    /// Attributed product
    pub product: Option<String>,
    /// Transport protocol reported during discovery
    pub transport: Option<String>,
    /// Country reported during discovery
    pub country: Option<String>,
}

/// One unit of scan work against one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTask {
    /// Run-unique task id
    pub id: u64,
    /// Target service
    pub key: HostKey,
    /// Kind of scan requested
    pub kind: ScanKind,
    /// Pool the task runs on
    pub worker_class: WorkerClass,
    /// Script name for custom script kinds
    pub script: Option<String>,
    /// Discovery facts about the host
    pub context: ScanContext,
}

impl ScanTask {
    /// Creates a task, deriving the worker class from the kind
    pub fn new(id: u64, key: HostKey, kind: ScanKind) -> Self {
        Self {
            id,
            key,
            kind,
            worker_class: kind.worker_class(),
            script: None,
            context: ScanContext::default(),
        }
    }

    /// Sets the script name
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Sets the discovery context
    pub fn with_context(mut self, context: ScanContext) -> Self {
        self.context = context;
        self
    }
}

/// Terminal state of a scan task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Engine returned findings
    Success,
    /// Engine failed on every attempt
    Failed,
    /// Task exceeded its deadline
    Timeout,
    /// Run was cancelled before the task finished
    Cancelled,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Success => "success",
            ScanStatus::Failed => "failed",
            ScanStatus::Timeout => "timeout",
            ScanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol
    Tcp,
    /// UDP protocol
    Udp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::ScanFailure(format!("unknown protocol '{}'", other))),
        }
    }
}

/// Open port reported by a scan engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Port {
    /// Port number (1-65535)
    pub number: u16,

    /// Protocol (tcp/udp)
    pub protocol: Protocol,

    /// Service detected on this port
    pub service: Option<Service>,
}

impl Port {
    /// Creates a new Port with the given number and protocol
    pub fn new(number: u16, protocol: Protocol) -> Self {
        Self {
            number,
            protocol,
            service: None,
        }
    }

    /// Creates a new Port with service information
    pub fn with_service(number: u16, protocol: Protocol, service: Service) -> Self {
        Self {
            number,
            protocol,
            service: Some(service),
        }
    }
}

/// Service information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    /// Service name (e.g., "http", "ssh")
    pub name: String,

    /// Product and version text (e.g., "nginx 1.18.0")
    pub product: Option<String>,

    /// CPE identifiers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpes: Vec<String>,
}

impl Service {
    /// Creates a new Service with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            product: None,
            cpes: Vec::new(),
        }
    }

    /// Sets the product text
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }
}

/// TLS-Scanner verdicts for one service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFindings {
    /// Attack name to vulnerable flag
    #[serde(default)]
    pub attacks: BTreeMap<String, bool>,
    /// Bug name to present flag
    #[serde(default)]
    pub bugs: BTreeMap<String, bool>,
}

impl TlsFindings {
    /// Names of attacks the service is vulnerable to
    pub fn vulnerable_attacks(&self) -> impl Iterator<Item = &str> {
        self.attacks
            .iter()
            .filter(|(_, vulnerable)| **vulnerable)
            .map(|(name, _)| name.as_str())
    }
}

/// Structured findings of a successful scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFindings {
    /// Open ports with service details
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,

    /// CVE id to reference URL
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vulnerabilities: BTreeMap<String, String>,

    /// TLS analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFindings>,

    /// Output of a custom script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_output: Option<serde_json::Value>,
}

impl ScanFindings {
    /// Returns true if nothing was found
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
            && self.vulnerabilities.is_empty()
            && self.tls.is_none()
            && self.script_output.is_none()
    }

    /// Folds `other` into `self`
    ///
    /// Ports are keyed by (number, protocol) with the newer entry winning,
    /// vulnerabilities are unioned, TLS and script output are replaced when
    /// `other` carries them.
    pub fn absorb(&mut self, other: ScanFindings) {
        for port in other.ports {
            match self
                .ports
                .iter_mut()
                .find(|p| p.number == port.number && p.protocol == port.protocol)
            {
                Some(existing) => *existing = port,
                None => self.ports.push(port),
            }
        }
        self.ports.sort_by_key(|p| (p.number, p.protocol as u8));
        self.vulnerabilities.extend(other.vulnerabilities);
        if other.tls.is_some() {
            self.tls = other.tls;
        }
        if other.script_output.is_some() {
            self.script_output = other.script_output;
        }
    }
}

/// Result of one attempted scan task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Task the outcome belongs to
    pub task: ScanTask,
    /// Terminal status
    pub status: ScanStatus,
    /// Number of engine invocations made
    pub attempts: u32,
    /// Findings, present only on success
    pub findings: Option<ScanFindings>,
    /// Error detail for non-successful outcomes
    pub error: Option<String>,
    /// Completion time
    pub finished_at: DateTime<Utc>,
}

impl ScanOutcome {
    /// Successful outcome
    pub fn success(task: ScanTask, attempts: u32, findings: ScanFindings) -> Self {
        Self::build(task, ScanStatus::Success, attempts, Some(findings), None)
    }

    /// Outcome for a task whose engine failed on every attempt
    pub fn failed(task: ScanTask, attempts: u32, error: impl Into<String>) -> Self {
        Self::build(task, ScanStatus::Failed, attempts, None, Some(error.into()))
    }

    /// Outcome for a task that exceeded its deadline
    pub fn timeout(task: ScanTask, attempts: u32, error: impl Into<String>) -> Self {
        Self::build(task, ScanStatus::Timeout, attempts, None, Some(error.into()))
    }

    /// Outcome for a task interrupted by cancellation
    pub fn cancelled(task: ScanTask, attempts: u32) -> Self {
        Self::build(
            task,
            ScanStatus::Cancelled,
            attempts,
            None,
            Some("run cancelled".to_string()),
        )
    }

    fn build(
        task: ScanTask,
        status: ScanStatus,
        attempts: u32,
        findings: Option<ScanFindings>,
        error: Option<String>,
    ) -> Self {
        Self {
            task,
            status,
            attempts,
            findings,
            error,
            finished_at: Utc::now(),
        }
    }

    /// Returns true for successful outcomes
    pub fn is_success(&self) -> bool {
        self.status == ScanStatus::Success
    }
}

/// Latest scan status of one kind on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStatusEntry {
    /// Terminal status of the latest outcome
    pub status: ScanStatus,
    /// Engine invocations of the latest outcome
    pub attempts: u32,
    /// Error detail of the latest outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Latest run of one custom script on a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRun {
    /// Status of the latest outcome
    #[serde(flatten)]
    pub status: ScanStatusEntry,
    /// Output of the latest successful run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Merged, confidence-resolved representation of one host
///
/// This is the unit of persistence and what the map and report collaborators
/// read. It is only ever mutated through the store's per-key update, so merges
/// for the same key never race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Identity of the record
    pub key: HostKey,

    /// Winning attribution; more than one entry when claims tie
    #[serde(default)]
    pub attribution: Vec<Attribution>,

    /// Every distinct claim observed for the host
    #[serde(default)]
    pub claims: Vec<Attribution>,

    /// True when tied winners name different vendors or products
    #[serde(default)]
    pub ambiguous: bool,

    /// Raw attributes per backend, conflicting values kept side by side
    #[serde(default)]
    pub sources: BTreeMap<Engine, Vec<HostAttributes>>,

    /// Distinct banners across all backends, first-seen order
    #[serde(default)]
    pub banners: Vec<String>,

    /// Successful findings per scan kind
    #[serde(default)]
    pub findings: BTreeMap<ScanKind, ScanFindings>,

    /// Latest status per scan kind, including failures
    #[serde(default)]
    pub scan_status: BTreeMap<ScanKind, ScanStatusEntry>,

    /// Custom script runs per kind, keyed by script name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<ScanKind, BTreeMap<String, ScriptRun>>,

    /// Time of the last content change
    pub last_updated: DateTime<Utc>,
}

impl HostRecord {
    /// Creates an empty record for a key
    pub fn new(key: HostKey) -> Self {
        Self {
            key,
            attribution: Vec::new(),
            claims: Vec::new(),
            ambiguous: false,
            sources: BTreeMap::new(),
            banners: Vec::new(),
            findings: BTreeMap::new(),
            scan_status: BTreeMap::new(),
            scripts: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Compares everything except `last_updated`
    pub fn same_content(&self, other: &HostRecord) -> bool {
        self.key == other.key
            && self.attribution == other.attribution
            && self.claims == other.claims
            && self.ambiguous == other.ambiguous
            && self.sources == other.sources
            && self.banners == other.banners
            && self.findings == other.findings
            && self.scan_status == other.scan_status
            && self.scripts == other.scripts
    }

    /// First winning attribution
    pub fn primary(&self) -> Option<&Attribution> {
        self.attribution.first()
    }

    /// Engines that reported the host
    pub fn engines(&self) -> impl Iterator<Item = Engine> + '_ {
        self.sources.keys().copied()
    }

    /// First country reported by any backend
    pub fn country(&self) -> Option<&str> {
        self.sources
            .values()
            .flatten()
            .filter_map(|attrs| attrs.location.as_ref())
            .find_map(|loc| loc.country.as_deref())
    }

    /// First transport protocol reported by any backend
    pub fn transport(&self) -> Option<&str> {
        self.sources
            .values()
            .flatten()
            .find_map(|attrs| attrs.transport.as_deref())
    }

    /// Union of backend-reported and scanned vulnerability ids, sorted
    pub fn vulnerabilities(&self) -> Vec<String> {
        let mut vulns: Vec<String> = self
            .sources
            .values()
            .flatten()
            .flat_map(|attrs| attrs.vulnerabilities.iter().cloned())
            .chain(
                self.findings
                    .values()
                    .flat_map(|f| f.vulnerabilities.keys().cloned()),
            )
            .collect();
        vulns.sort();
        vulns.dedup();
        vulns
    }

    /// Returns true if any vulnerability is known for the host
    pub fn has_vulns(&self) -> bool {
        !self.vulnerabilities().is_empty()
    }

    /// Status of a scan kind, if it ran
    ///
    /// Custom script kinds are tracked per script, see [`HostRecord::script_status`].
    pub fn status_of(&self, kind: ScanKind) -> Option<ScanStatus> {
        self.scan_status.get(&kind).map(|entry| entry.status)
    }

    /// Status of one custom script, if it ran
    pub fn script_status(&self, kind: ScanKind, script: &str) -> Option<ScanStatus> {
        self.scripts
            .get(&kind)?
            .get(script)
            .map(|run| run.status.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(engine: Engine, qc: Confidence, vc: Confidence) -> Query {
        Query {
            vendor: "Acme".to_string(),
            product: "Widget".to_string(),
            engine,
            query: "product:widget".to_string(),
            query_confidence: qc,
            vendor_confidence: vc,
            scripts: CustomScripts::default(),
        }
    }

    #[test]
    fn test_confidence_total_order() {
        let mut levels = vec![Confidence::Certain, Confidence::Tentative, Confidence::Firm];
        levels.sort();
        assert_eq!(levels, Confidence::ALL.to_vec());
    }

    #[test]
    fn test_confidence_parse_case_insensitive() {
        assert_eq!("CERTAIN".parse::<Confidence>().unwrap(), Confidence::Certain);
        assert_eq!(" firm ".parse::<Confidence>().unwrap(), Confidence::Firm);
        assert!("probable".parse::<Confidence>().is_err());
    }

    #[test]
    fn test_confidence_serialization() {
        let json = serde_json::to_string(&Confidence::Tentative).unwrap();
        assert_eq!(json, r#""tentative""#);
    }

    #[test]
    fn test_host_key_display() {
        let v4 = HostKey::new("203.0.113.7".parse().unwrap(), 443);
        assert_eq!(v4.to_string(), "203.0.113.7:443");

        let v6 = HostKey::new("2001:db8::1".parse().unwrap(), 8443);
        assert_eq!(v6.to_string(), "[2001:db8::1]:8443");
    }

    #[test]
    fn test_host_key_ordering() {
        let a = HostKey::new("10.0.0.1".parse().unwrap(), 80);
        let b = HostKey::new("10.0.0.1".parse().unwrap(), 443);
        let c = HostKey::new("10.0.0.2".parse().unwrap(), 22);
        let mut keys = vec![c, b, a];
        keys.sort();
        assert_eq!(keys, vec![a, b, c]);
    }

    #[test]
    fn test_scan_kind_worker_class() {
        assert_eq!(ScanKind::PortService.worker_class(), WorkerClass::Nmap);
        assert_eq!(ScanKind::Tls.worker_class(), WorkerClass::Nmap);
        assert_eq!(ScanKind::NseScript.worker_class(), WorkerClass::Nmap);
        assert_eq!(ScanKind::Vulnerability.worker_class(), WorkerClass::Vulners);
        assert_eq!(ScanKind::PythonScript.worker_class(), WorkerClass::Vulners);
    }

    #[test]
    fn test_scan_kind_parse() {
        assert_eq!("vulners".parse::<ScanKind>().unwrap(), ScanKind::Vulnerability);
        assert_eq!("port-service".parse::<ScanKind>().unwrap(), ScanKind::PortService);
        assert!("ping".parse::<ScanKind>().is_err());
    }

    #[test]
    fn test_scan_kind_as_map_key() {
        let mut findings = BTreeMap::new();
        findings.insert(ScanKind::Tls, ScanFindings::default());
        let json = serde_json::to_string(&findings).unwrap();
        assert_eq!(json, r#"{"tls":{}}"#);
    }

    #[test]
    fn test_attribution_from_query() {
        let q = query(Engine::Censys, Confidence::Firm, Confidence::Certain);
        let attribution = Attribution::from_query(&q);
        assert_eq!(attribution.vendor, "Acme");
        assert_eq!(attribution.engine, Engine::Censys);
        assert_eq!(attribution.rank(), (Confidence::Firm, Confidence::Certain));
    }

    #[test]
    fn test_findings_absorb() {
        let mut base = ScanFindings {
            ports: vec![Port::new(443, Protocol::Tcp)],
            ..Default::default()
        };
        base.vulnerabilities
            .insert("CVE-2021-1234".into(), "https://vulners.com/cve/CVE-2021-1234".into());

        let mut update = ScanFindings {
            ports: vec![
                Port::with_service(443, Protocol::Tcp, Service::new("https")),
                Port::new(22, Protocol::Tcp),
            ],
            ..Default::default()
        };
        update
            .vulnerabilities
            .insert("CVE-2022-0001".into(), "https://vulners.com/cve/CVE-2022-0001".into());

        base.absorb(update);
        assert_eq!(base.ports.len(), 2);
        assert_eq!(base.ports[0].number, 22);
        assert!(base.ports[1].service.is_some());
        assert_eq!(base.vulnerabilities.len(), 2);
    }

    #[test]
    fn test_outcome_constructors() {
        let task = ScanTask::new(1, HostKey::new("198.51.100.1".parse().unwrap(), 80), ScanKind::PortService);
        let ok = ScanOutcome::success(task.clone(), 1, ScanFindings::default());
        assert!(ok.is_success());
        assert!(ok.error.is_none());

        let failed = ScanOutcome::failed(task.clone(), 2, "exit status 1");
        assert_eq!(failed.status, ScanStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(failed.findings.is_none());

        let cancelled = ScanOutcome::cancelled(task, 0);
        assert_eq!(cancelled.status, ScanStatus::Cancelled);
    }

    #[test]
    fn test_record_vulnerabilities_union() {
        let key = HostKey::new("198.51.100.2".parse().unwrap(), 443);
        let mut record = HostRecord::new(key);
        record.sources.insert(
            Engine::Shodan,
            vec![HostAttributes {
                vulnerabilities: vec!["CVE-2020-0001".into(), "CVE-2021-0002".into()],
                ..Default::default()
            }],
        );
        let mut findings = ScanFindings::default();
        findings
            .vulnerabilities
            .insert("CVE-2021-0002".into(), "https://vulners.com/cve/CVE-2021-0002".into());
        record.findings.insert(ScanKind::Vulnerability, findings);

        assert_eq!(record.vulnerabilities(), vec!["CVE-2020-0001", "CVE-2021-0002"]);
        assert!(record.has_vulns());
    }

    #[test]
    fn test_record_same_content_ignores_timestamp() {
        let key = HostKey::new("198.51.100.3".parse().unwrap(), 22);
        let a = HostRecord::new(key);
        let mut b = a.clone();
        b.last_updated = a.last_updated + chrono::Duration::seconds(30);
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_record_serialization() {
        let key = HostKey::new("203.0.113.7".parse().unwrap(), 443);
        let mut record = HostRecord::new(key);
        record.banners.push("HTTP/1.1 200 OK".into());
        record.scan_status.insert(
            ScanKind::PortService,
            ScanStatusEntry {
                status: ScanStatus::Timeout,
                attempts: 1,
                error: Some("deadline".into()),
            },
        );

        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: HostRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
        assert_eq!(back.status_of(ScanKind::PortService), Some(ScanStatus::Timeout));
    }
}
