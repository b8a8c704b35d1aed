//! Run configuration
//!
//! Everything the coordinator needs is carried by [`RunConfig`], built once and
//! passed in at construction. Values come from defaults, an optional TOML or
//! JSON file, and a handful of environment overrides, in that order.

use crate::catalog::CatalogFilter;
use crate::error::{Error, Result};
use crate::types::{Confidence, ScanKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default result cap per Shodan query
pub const SHODAN_DEFAULT_RESULTS: usize = 100_000;
/// Default result cap per Censys query
pub const CENSYS_DEFAULT_RESULTS: usize = 100_000;
/// Result cap of the Censys free plan
pub const CENSYS_FREE_PLAN_RESULTS: usize = 1_000;
/// Concurrent queries per backend
pub const DEFAULT_DISCOVERY_CONCURRENCY: usize = 3;
/// Workers per scan pool
pub const DEFAULT_WORKERS: usize = 10;
/// File name of the persisted store inside the results directory
pub const RESULTS_FILE: &str = "all_results.json";

const SHODAN_KEY_ENV: &str = "SHODAN_API_KEY";
const CENSYS_ID_ENV: &str = "CENSYS_API_ID";
const CENSYS_SECRET_ENV: &str = "CENSYS_API_SECRET";

// Placeholders shipped in sample configs; treated as "not configured".
const PLACEHOLDERS: [&str; 3] = [
    "YOUR_DEFAULT_API_KEY",
    "YOUR_CENSYS_API_ID",
    "YOUR_CENSYS_API_SECRET",
];

/// Retry schedule for rate-limited backend requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each further failure
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt number `attempt` (0-based, attempt > 0)
    ///
    /// # Examples
    ///
    /// ```
    /// use grinder_core::config::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy { attempts: 3, base_delay: Duration::from_millis(100) };
    /// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    /// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Backend credentials
///
/// Secrets never appear in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Shodan API key
    pub shodan_api_key: Option<String>,
    /// Censys API id
    pub censys_api_id: Option<String>,
    /// Censys API secret
    pub censys_api_secret: Option<String>,
}

impl Credentials {
    /// Fills missing values from the process environment
    pub fn with_env_fallback(mut self) -> Self {
        fn pick(explicit: Option<String>, var: &str) -> Option<String> {
            explicit
                .filter(|v| is_configured(v))
                .or_else(|| std::env::var(var).ok().filter(|v| is_configured(v)))
        }
        self.shodan_api_key = pick(self.shodan_api_key, SHODAN_KEY_ENV);
        self.censys_api_id = pick(self.censys_api_id, CENSYS_ID_ENV);
        self.censys_api_secret = pick(self.censys_api_secret, CENSYS_SECRET_ENV);
        self
    }

    /// Shodan key, if configured
    pub fn shodan(&self) -> Option<&str> {
        self.shodan_api_key.as_deref().filter(|v| is_configured(v))
    }

    /// Censys id and secret, if both are configured
    pub fn censys(&self) -> Option<(&str, &str)> {
        let id = self.censys_api_id.as_deref().filter(|v| is_configured(v))?;
        let secret = self.censys_api_secret.as_deref().filter(|v| is_configured(v))?;
        Some((id, secret))
    }
}

fn is_configured(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !PLACEHOLDERS.contains(&value)
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mask(v: &Option<String>) -> &'static str {
            if v.is_some() {
                "<redacted>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("Credentials")
            .field("shodan_api_key", &mask(&self.shodan_api_key))
            .field("censys_api_id", &mask(&self.censys_api_id))
            .field("censys_api_secret", &mask(&self.censys_api_secret))
            .finish()
    }
}

/// Parameters of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Backend credentials
    pub credentials: Credentials,

    /// Result cap per Shodan query
    pub shodan_max_results: usize,
    /// Result cap per Censys query
    pub censys_max_results: usize,
    /// Concurrent queries per backend
    pub discovery_concurrency: usize,
    /// Retry schedule for rate-limited requests
    pub rate_limit_retry: RetryPolicy,

    /// Minimum vendor confidence
    pub vendor_confidence: Option<Confidence>,
    /// Minimum query confidence
    pub query_confidence: Option<Confidence>,
    /// Vendor allow-list (case-insensitive substring match)
    pub vendors: Vec<String>,

    /// Scan kinds to run after discovery
    pub scan_kinds: BTreeSet<ScanKind>,
    /// Workers in the nmap-class pool
    pub nmap_workers: usize,
    /// Workers in the vulners-class pool
    pub vulners_workers: usize,
    /// Extra engine invocations after a failure
    pub scan_retries: u32,
    /// Deadline of a port/service scan
    #[serde(with = "duration_secs")]
    pub nmap_timeout: Duration,
    /// Deadline of a vulnerability scan
    #[serde(with = "duration_secs")]
    pub vulners_timeout: Duration,
    /// Deadline of a TLS analysis
    #[serde(with = "duration_secs")]
    pub tls_timeout: Duration,
    /// Deadline of a custom script
    #[serde(with = "duration_secs")]
    pub script_timeout: Duration,
    /// Record but do not deep-scan hosts that are not globally routable
    pub skip_non_global: bool,

    /// Base nmap arguments for port/service scans
    pub nmap_arguments: String,
    /// Path of the vulners NSE script
    pub vulners_script: PathBuf,
    /// Path of the TLS-Scanner jar
    pub tls_scanner_jar: PathBuf,
    /// Directory holding `nse_scripts/` and `py_scripts/`
    pub scripts_dir: PathBuf,
    /// Directory the store is persisted to
    pub results_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            shodan_max_results: SHODAN_DEFAULT_RESULTS,
            censys_max_results: CENSYS_DEFAULT_RESULTS,
            discovery_concurrency: DEFAULT_DISCOVERY_CONCURRENCY,
            rate_limit_retry: RetryPolicy::default(),
            vendor_confidence: None,
            query_confidence: None,
            vendors: Vec::new(),
            scan_kinds: BTreeSet::new(),
            nmap_workers: DEFAULT_WORKERS,
            vulners_workers: DEFAULT_WORKERS,
            scan_retries: 1,
            nmap_timeout: Duration::from_secs(30),
            vulners_timeout: Duration::from_secs(120),
            tls_timeout: Duration::from_secs(1200),
            script_timeout: Duration::from_secs(120),
            skip_non_global: false,
            nmap_arguments: "-Pn -T4 -A".to_string(),
            vulners_script: PathBuf::from("plugins/vulners.nse"),
            tls_scanner_jar: PathBuf::from("TLS-Scanner/apps/TLS-Scanner.jar"),
            scripts_dir: PathBuf::from("custom_scripts"),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl RunConfig {
    /// Loads a config file, picking the format from its extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;

        let config: RunConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            other => {
                return Err(Error::config(format!(
                    "unsupported config file format: {}",
                    other.unwrap_or("<none>")
                )))
            }
        };
        Ok(config)
    }

    /// Applies environment overrides and credential fallbacks
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(workers) = std::env::var("GRINDER_NMAP_WORKERS") {
            self.nmap_workers = workers
                .parse()
                .map_err(|_| Error::config(format!("invalid GRINDER_NMAP_WORKERS: {}", workers)))?;
        }
        if let Ok(workers) = std::env::var("GRINDER_VULNERS_WORKERS") {
            self.vulners_workers = workers.parse().map_err(|_| {
                Error::config(format!("invalid GRINDER_VULNERS_WORKERS: {}", workers))
            })?;
        }
        if let Ok(dir) = std::env::var("GRINDER_RESULTS_DIR") {
            self.results_dir = PathBuf::from(dir);
        }
        self.credentials = self.credentials.with_env_fallback();
        Ok(self)
    }

    /// Rejects values that would stall or disable the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.nmap_workers == 0 || self.vulners_workers == 0 {
            return Err(Error::config("worker counts must be at least 1"));
        }
        if self.discovery_concurrency == 0 {
            return Err(Error::config("discovery concurrency must be at least 1"));
        }
        if self.rate_limit_retry.attempts == 0 {
            return Err(Error::config("rate limit retry attempts must be at least 1"));
        }
        for (name, timeout) in [
            ("nmap", self.nmap_timeout),
            ("vulners", self.vulners_timeout),
            ("tls", self.tls_timeout),
            ("script", self.script_timeout),
        ] {
            if timeout.is_zero() {
                return Err(Error::config(format!("{} timeout must be non-zero", name)));
            }
        }
        Ok(())
    }

    /// Catalog filter derived from the thresholds and allow-list
    pub fn catalog_filter(&self) -> CatalogFilter {
        CatalogFilter {
            vendors: self.vendors.clone(),
            min_vendor_confidence: self.vendor_confidence,
            min_query_confidence: self.query_confidence,
        }
    }

    /// Deadline for a scan kind
    pub fn timeout_for(&self, kind: ScanKind) -> Duration {
        match kind {
            ScanKind::PortService => self.nmap_timeout,
            ScanKind::Vulnerability => self.vulners_timeout,
            ScanKind::Tls => self.tls_timeout,
            ScanKind::NseScript | ScanKind::PythonScript => self.script_timeout,
        }
    }

    /// Path of the persisted store
    pub fn results_path(&self) -> PathBuf {
        self.results_dir.join(RESULTS_FILE)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.nmap_workers, 10);
        assert_eq!(config.vulners_workers, 10);
        assert_eq!(config.discovery_concurrency, 3);
        assert_eq!(config.rate_limit_retry.attempts, 3);
        assert_eq!(config.scan_retries, 1);
        assert_eq!(config.nmap_timeout, Duration::from_secs(30));
        assert!(config.scan_kinds.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = RunConfig {
            nmap_workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = RunConfig {
            tls_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
nmap_workers = 4
vulners_workers = 2
nmap_timeout = 45
query_confidence = "firm"
vendors = ["siemens"]
scan_kinds = ["port_service", "vulnerability"]

[rate_limit_retry]
attempts = 5
base_delay = 200
"#
        )
        .unwrap();

        let config = RunConfig::from_file(file.path()).unwrap();
        assert_eq!(config.nmap_workers, 4);
        assert_eq!(config.vulners_workers, 2);
        assert_eq!(config.nmap_timeout, Duration::from_secs(45));
        assert_eq!(config.query_confidence, Some(Confidence::Firm));
        assert_eq!(config.vendors, vec!["siemens"]);
        assert!(config.scan_kinds.contains(&ScanKind::Vulnerability));
        assert_eq!(config.rate_limit_retry.base_delay, Duration::from_millis(200));
        // untouched fields keep their defaults
        assert_eq!(config.tls_timeout, Duration::from_secs(1200));
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            RunConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_placeholder_credentials_are_unset() {
        let creds = Credentials {
            shodan_api_key: Some("YOUR_DEFAULT_API_KEY".into()),
            censys_api_id: Some("id".into()),
            censys_api_secret: None,
        };
        assert!(creds.shodan().is_none());
        assert!(creds.censys().is_none());
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials {
            shodan_api_key: Some("s3cr3t".into()),
            ..Default::default()
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_catalog_filter_from_config() {
        let config = RunConfig {
            vendor_confidence: Some(Confidence::Certain),
            vendors: vec!["acme".into()],
            ..Default::default()
        };
        let filter = config.catalog_filter();
        assert_eq!(filter.min_vendor_confidence, Some(Confidence::Certain));
        assert!(filter.min_query_confidence.is_none());
        assert_eq!(filter.vendors, vec!["acme"]);
    }
}
