//! Concurrent host record store with JSON persistence
//!
//! Records live in a sharded map keyed by [`HostKey`]. All mutation goes
//! through [`HostRecordStore::update`], which holds the key's entry for the
//! duration of the merge closure: merges for one key are serialized while
//! different keys proceed in parallel.
//!
//! # Example
//!
//! ```
//! use grinder_core::store::{HostRecordStore, RecordQuery};
//! use grinder_core::types::{HostKey, HostRecord};
//!
//! let store = HostRecordStore::new();
//! let key = HostKey::new("203.0.113.7".parse().unwrap(), 443);
//! assert!(store.upsert(HostRecord::new(key)));
//! assert_eq!(store.len(), 1);
//! assert!(store.lookup(&key).is_some());
//! assert_eq!(store.query(&RecordQuery::default()).len(), 1);
//! ```

use crate::error::{Error, Result};
use crate::types::{Engine, HostKey, HostRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Filter for the read path used by reporting and map consumers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Case-insensitive substring of an attributed vendor
    pub vendor: Option<String>,
    /// Case-insensitive substring of an attributed product
    pub product: Option<String>,
    /// Country name, case-insensitive
    pub country: Option<String>,
    /// Backend that reported the host
    pub engine: Option<Engine>,
    /// Only hosts with at least one known vulnerability
    pub vulnerable_only: bool,
    /// Only hosts with ambiguous attribution
    pub ambiguous_only: bool,
}

impl RecordQuery {
    /// Restricts to a vendor
    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    /// Restricts to a product
    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    /// Restricts to a country
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Restricts to hosts reported by `engine`
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Keeps only vulnerable hosts
    pub fn vulnerable(mut self) -> Self {
        self.vulnerable_only = true;
        self
    }

    /// Keeps only ambiguous hosts
    pub fn ambiguous(mut self) -> Self {
        self.ambiguous_only = true;
        self
    }

    /// Returns true if `record` passes every set criterion
    pub fn matches(&self, record: &HostRecord) -> bool {
        fn contains(haystack: &str, needle: &str) -> bool {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }

        if let Some(vendor) = &self.vendor {
            if !record.attribution.iter().any(|a| contains(&a.vendor, vendor)) {
                return false;
            }
        }
        if let Some(product) = &self.product {
            if !record.attribution.iter().any(|a| contains(&a.product, product)) {
                return false;
            }
        }
        if let Some(country) = &self.country {
            if !record
                .country()
                .map_or(false, |c| c.eq_ignore_ascii_case(country))
            {
                return false;
            }
        }
        if let Some(engine) = self.engine {
            if !record.sources.contains_key(&engine) {
                return false;
            }
        }
        if self.vulnerable_only && !record.has_vulns() {
            return false;
        }
        if self.ambiguous_only && !record.ambiguous {
            return false;
        }
        true
    }
}

/// Sharded map of host records
#[derive(Debug, Default)]
pub struct HostRecordStore {
    records: DashMap<HostKey, HostRecord>,
}

impl HostRecordStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from records; later duplicates of a key replace earlier ones
    pub fn from_records(records: impl IntoIterator<Item = HostRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.key, record);
        }
        store
    }

    /// Inserts or replaces a record
    ///
    /// A record whose content equals the stored one is ignored, so the
    /// stored `last_updated` survives. Returns true if the store changed.
    pub fn upsert(&self, record: HostRecord) -> bool {
        let key = record.key;
        self.update(key, move |_| record)
    }

    /// Replaces the record for `key` with `merge(current)`
    ///
    /// The key's entry stays locked while `merge` runs, so concurrent updates
    /// of one key never interleave. `merge` must not access the store.
    /// Returns true if the stored content changed.
    pub fn update<F>(&self, key: HostKey, merge: F) -> bool
    where
        F: FnOnce(Option<&HostRecord>) -> HostRecord,
    {
        match self.records.entry(key) {
            Entry::Occupied(mut entry) => {
                let merged = merge(Some(entry.get()));
                if merged.same_content(entry.get()) {
                    false
                } else {
                    entry.insert(merged);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(merge(None));
                true
            }
        }
    }

    /// Snapshot of one record
    pub fn lookup(&self, key: &HostKey) -> Option<HostRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Returns true if a record exists for `key`
    pub fn contains(&self, key: &HostKey) -> bool {
        self.records.contains_key(key)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the store holds no record
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of every record, ordered by key
    pub fn records(&self) -> Vec<HostRecord> {
        let mut records: Vec<HostRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.key);
        records
    }

    /// Records matching `query`, ordered by key
    pub fn query(&self, query: &RecordQuery) -> Vec<HostRecord> {
        let mut records: Vec<HostRecord> = self
            .records
            .iter()
            .filter(|r| query.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.key);
        records
    }

    /// Writes every record as a JSON array
    ///
    /// The file is written next to `path` and renamed into place, so readers
    /// never see a partial file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);

        let records = self.records();
        {
            let file = fs::File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &records)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| Error::Io(e.into_error()))?
                .sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        info!(path = %path.display(), records = records.len(), "results saved");
        Ok(())
    }

    /// Loads records written by [`HostRecordStore::save`]
    ///
    /// A missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no previous results");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        let records: Vec<HostRecord> = serde_json::from_str(&content)?;
        debug!(path = %path.display(), records = records.len(), "results loaded");
        Ok(Self::from_records(records))
    }
}
