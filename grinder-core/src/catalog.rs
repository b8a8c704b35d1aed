//! Query catalog loading, validation and filtering
//!
//! The catalog file is a JSON array of vendor/product entries, each carrying
//! its Shodan and Censys queries and an optional pair of custom scripts:
//!
//! ```json
//! [
//!   {
//!     "vendor": "Acme",
//!     "product": "Widget",
//!     "vendor_confidence": "certain",
//!     "shodan_queries": [{"query": "product:widget", "query_confidence": "certain"}],
//!     "censys_queries": [{"query": "services.service_name: widget", "query_confidence": "firm"}],
//!     "scripts": {"nse_script": "widget-info.nse", "py_script": ""}
//!   }
//! ]
//! ```
//!
//! Empty script names mean "no script". Everything else that is malformed is
//! a [`Error::Config`], raised before any network activity.
//!
//! # Example
//!
//! ```
//! use grinder_core::catalog::{Catalog, CatalogFilter};
//! use grinder_core::types::Confidence;
//!
//! let json = r#"[{"vendor": "Acme", "product": "Widget", "vendor_confidence": "firm",
//!                 "shodan_queries": [{"query": "product:widget", "query_confidence": "certain"}]}]"#;
//! let catalog = Catalog::from_json(json).unwrap();
//! assert_eq!(catalog.query_count(), 1);
//!
//! let strict = catalog.filter(&CatalogFilter {
//!     min_vendor_confidence: Some(Confidence::Certain),
//!     ..Default::default()
//! });
//! assert!(strict.is_empty());
//! ```

use crate::error::{Error, Result};
use crate::types::{Attribution, Confidence, CustomScripts, Engine, Query, VendorEntry};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Subdirectory of the scripts dir holding NSE scripts
pub const NSE_SCRIPTS_DIR: &str = "nse_scripts";
/// Subdirectory of the scripts dir holding Python scripts
pub const PY_SCRIPTS_DIR: &str = "py_scripts";

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    product: String,
    #[serde(default)]
    vendor_confidence: String,
    #[serde(default)]
    shodan_queries: Vec<RawQuery>,
    #[serde(default)]
    censys_queries: Vec<RawQuery>,
    #[serde(default)]
    scripts: Option<RawScripts>,
}

#[derive(Debug, Deserialize)]
struct RawQuery {
    #[serde(default)]
    query: String,
    #[serde(default)]
    query_confidence: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawScripts {
    #[serde(default)]
    nse_script: Option<String>,
    #[serde(default)]
    py_script: Option<String>,
}

/// Selection applied to a loaded catalog
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFilter {
    /// Vendor allow-list; empty keeps every vendor
    pub vendors: Vec<String>,
    /// Minimum vendor confidence
    pub min_vendor_confidence: Option<Confidence>,
    /// Minimum query confidence
    pub min_query_confidence: Option<Confidence>,
}

impl CatalogFilter {
    /// Vendor names match when they contain any allow-list entry, ignoring case
    fn allows_vendor(&self, vendor: &str) -> bool {
        if self.vendors.is_empty() {
            return true;
        }
        let vendor = vendor.to_lowercase();
        self.vendors
            .iter()
            .any(|needle| vendor.contains(&needle.to_lowercase()))
    }

    /// A query passes iff both its own and its vendor's confidence meet the thresholds
    pub fn allows(&self, query: &Query) -> bool {
        self.min_query_confidence
            .map_or(true, |min| query.query_confidence >= min)
            && self
                .min_vendor_confidence
                .map_or(true, |min| query.vendor_confidence >= min)
    }

    /// True when the filter keeps everything
    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
            && self.min_vendor_confidence.is_none()
            && self.min_query_confidence.is_none()
    }

    /// Whether a stored attribution would have come from a query this filter keeps
    pub fn allows_attribution(&self, attribution: &Attribution) -> bool {
        self.allows_vendor(&attribution.vendor)
            && self
                .min_query_confidence
                .map_or(true, |min| attribution.query_confidence >= min)
            && self
                .min_vendor_confidence
                .map_or(true, |min| attribution.vendor_confidence >= min)
    }
}

/// Loads catalog files, optionally checking script references on disk
#[derive(Debug, Clone, Default)]
pub struct CatalogLoader {
    scripts_dir: Option<PathBuf>,
}

impl CatalogLoader {
    /// Loader that does not check script files
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that requires every referenced script to exist under `dir`
    pub fn with_scripts_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: Some(dir.into()),
        }
    }

    /// Reads and validates a catalog file
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Catalog> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read query file {}: {}", path.display(), e))
        })?;
        let catalog = self.parse(&content)?;
        debug!(
            path = %path.display(),
            vendors = catalog.len(),
            queries = catalog.query_count(),
            "loaded query catalog"
        );
        Ok(catalog)
    }

    /// Parses and validates catalog JSON
    pub fn parse(&self, json: &str) -> Result<Catalog> {
        let raw: Vec<RawEntry> = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("malformed query file: {}", e)))?;

        let entries = raw
            .into_iter()
            .enumerate()
            .map(|(index, entry)| self.build_entry(index, entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(Catalog { entries })
    }

    fn build_entry(&self, index: usize, raw: RawEntry) -> Result<VendorEntry> {
        let vendor = raw.vendor.trim().to_string();
        let product = raw.product.trim().to_string();
        if vendor.is_empty() {
            return Err(Error::config(format!("entry #{}: missing vendor", index)));
        }
        if product.is_empty() {
            return Err(Error::config(format!(
                "entry #{} ({}): missing product",
                index, vendor
            )));
        }

        let vendor_confidence: Confidence = raw.vendor_confidence.parse().map_err(|e| {
            Error::config(format!("entry #{} ({} {}): {}", index, vendor, product, e))
        })?;

        let raw_scripts = raw.scripts.unwrap_or_default();
        let scripts = CustomScripts {
            nse_script: self.check_script(&vendor, raw_scripts.nse_script, NSE_SCRIPTS_DIR)?,
            py_script: self.check_script(&vendor, raw_scripts.py_script, PY_SCRIPTS_DIR)?,
        };

        let mut queries = Vec::with_capacity(raw.shodan_queries.len() + raw.censys_queries.len());
        for (engine, list) in [
            (Engine::Shodan, raw.shodan_queries),
            (Engine::Censys, raw.censys_queries),
        ] {
            for raw_query in list {
                let text = raw_query.query.trim().to_string();
                if text.is_empty() {
                    return Err(Error::config(format!(
                        "entry #{} ({} {}): empty {} query",
                        index, vendor, product, engine
                    )));
                }
                let query_confidence: Confidence =
                    raw_query.query_confidence.parse().map_err(|e| {
                        Error::config(format!("query '{}' of {} {}: {}", text, vendor, product, e))
                    })?;
                queries.push(Arc::new(Query {
                    vendor: vendor.clone(),
                    product: product.clone(),
                    engine,
                    query: text,
                    query_confidence,
                    vendor_confidence,
                    scripts: scripts.clone(),
                }));
            }
        }

        Ok(VendorEntry {
            vendor,
            product,
            vendor_confidence,
            queries,
            scripts,
        })
    }

    fn check_script(
        &self,
        vendor: &str,
        name: Option<String>,
        subdir: &str,
    ) -> Result<Option<String>> {
        let Some(name) = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(Error::config(format!(
                "{}: script name '{}' must be a plain file name",
                vendor, name
            )));
        }
        if let Some(dir) = &self.scripts_dir {
            let path = dir.join(subdir).join(&name);
            if !path.is_file() {
                return Err(Error::config(format!(
                    "{}: script '{}' is not defined ({} not found)",
                    vendor,
                    name,
                    path.display()
                )));
            }
        }
        Ok(Some(name))
    }
}

/// Validated, ordered collection of vendor entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<VendorEntry>,
}

impl Catalog {
    /// Loads a catalog file without checking scripts on disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        CatalogLoader::new().load(path)
    }

    /// Parses catalog JSON without checking scripts on disk
    pub fn from_json(json: &str) -> Result<Self> {
        CatalogLoader::new().parse(json)
    }

    /// Builds a catalog from already validated entries
    pub fn from_entries(entries: Vec<VendorEntry>) -> Self {
        Self { entries }
    }

    /// Returns a catalog restricted by `filter`
    ///
    /// Entries whose vendor is not allowed, or which keep no query, are dropped.
    pub fn filter(&self, filter: &CatalogFilter) -> Catalog {
        let entries = self
            .entries
            .iter()
            .filter(|entry| filter.allows_vendor(&entry.vendor))
            .filter_map(|entry| {
                let queries: Vec<Arc<Query>> = entry
                    .queries
                    .iter()
                    .filter(|q| filter.allows(q))
                    .cloned()
                    .collect();
                if queries.is_empty() {
                    None
                } else {
                    Some(VendorEntry {
                        queries,
                        ..entry.clone()
                    })
                }
            })
            .collect();
        Catalog { entries }
    }

    /// Vendor entries in file order
    pub fn entries(&self) -> &[VendorEntry] {
        &self.entries
    }

    /// All queries in file order
    pub fn queries(&self) -> impl Iterator<Item = &Arc<Query>> {
        self.entries.iter().flat_map(|entry| entry.queries.iter())
    }

    /// Queries written for one backend
    pub fn queries_for(&self, engine: Engine) -> Vec<Arc<Query>> {
        self.queries()
            .filter(|q| q.engine == engine)
            .cloned()
            .collect()
    }

    /// Custom scripts of a vendor/product pair
    pub fn scripts_for(&self, vendor: &str, product: &str) -> Option<&CustomScripts> {
        self.entries
            .iter()
            .find(|entry| entry.vendor == vendor && entry.product == product)
            .map(|entry| &entry.scripts)
            .filter(|scripts| !scripts.is_empty())
    }

    /// Number of vendor entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no entry survived loading or filtering
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of queries across all entries
    pub fn query_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.queries.len()).sum()
    }
}
