//! Entity statistics over host records
//!
//! Counts how many records carry each vendor, product, port, transport,
//! country and vulnerability. A value is counted at most once per record.

use crate::types::HostRecord;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Default number of entries shown per entity
pub const DEFAULT_TOP_ENTITIES: usize = 6;

/// Per-value record counts for every entity kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    /// Records per attributed vendor
    pub vendors: BTreeMap<String, usize>,
    /// Records per attributed product
    pub products: BTreeMap<String, usize>,
    /// Records per port (record key and scanned open ports)
    pub ports: BTreeMap<u16, usize>,
    /// Records per transport protocol
    pub transports: BTreeMap<String, usize>,
    /// Records per country
    pub countries: BTreeMap<String, usize>,
    /// Records per vulnerability id
    pub vulnerabilities: BTreeMap<String, usize>,
}

/// Summary statistics of a record set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordStats {
    /// Number of records
    pub hosts: usize,
    /// Records with ambiguous attribution
    pub ambiguous: usize,
    /// Records with at least one known vulnerability
    pub vulnerable: usize,
    /// Value counts
    pub counts: EntityCounts,
}

fn bump<K: Ord>(map: &mut BTreeMap<K, usize>, values: BTreeSet<K>) {
    for value in values {
        *map.entry(value).or_default() += 1;
    }
}

fn top<K: Ord + Clone>(map: &BTreeMap<K, usize>, limit: usize) -> Vec<(K, usize)> {
    let mut entries: Vec<(K, usize)> = map.iter().map(|(k, n)| (k.clone(), *n)).collect();
    // highest count first, key order between equal counts
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

impl RecordStats {
    /// Counts entities across `records`
    pub fn collect<'a>(records: impl IntoIterator<Item = &'a HostRecord>) -> Self {
        let mut stats = RecordStats::default();
        for record in records {
            stats.hosts += 1;
            if record.ambiguous {
                stats.ambiguous += 1;
            }

            let vulns = record.vulnerabilities();
            if !vulns.is_empty() {
                stats.vulnerable += 1;
            }
            bump(&mut stats.counts.vulnerabilities, vulns.into_iter().collect());

            bump(
                &mut stats.counts.vendors,
                record.attribution.iter().map(|a| a.vendor.clone()).collect(),
            );
            bump(
                &mut stats.counts.products,
                record.attribution.iter().map(|a| a.product.clone()).collect(),
            );

            let mut ports: BTreeSet<u16> = record
                .findings
                .values()
                .flat_map(|f| f.ports.iter().map(|p| p.number))
                .collect();
            ports.insert(record.key.port);
            bump(&mut stats.counts.ports, ports);

            bump(
                &mut stats.counts.transports,
                record.transport().map(str::to_lowercase).into_iter().collect(),
            );
            bump(
                &mut stats.counts.countries,
                record.country().map(str::to_string).into_iter().collect(),
            );
        }
        stats
    }

    /// Most frequent values of every entity, at most `limit` each
    pub fn top(&self, limit: usize) -> TopEntities {
        TopEntities {
            hosts: self.hosts,
            vendors: top(&self.counts.vendors, limit),
            products: top(&self.counts.products, limit),
            ports: top(&self.counts.ports, limit),
            transports: top(&self.counts.transports, limit),
            countries: top(&self.counts.countries, limit),
            vulnerabilities: top(&self.counts.vulnerabilities, limit),
        }
    }
}

/// Limited view of [`RecordStats`], most frequent first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopEntities {
    /// Number of records counted
    pub hosts: usize,
    /// Top vendors
    pub vendors: Vec<(String, usize)>,
    /// Top products
    pub products: Vec<(String, usize)>,
    /// Top ports
    pub ports: Vec<(u16, usize)>,
    /// Top transports
    pub transports: Vec<(String, usize)>,
    /// Top countries
    pub countries: Vec<(String, usize)>,
    /// Top vulnerabilities
    pub vulnerabilities: Vec<(String, usize)>,
}

fn write_section<K: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    entries: &[(K, usize)],
) -> fmt::Result {
    if entries.is_empty() {
        return Ok(());
    }
    writeln!(f, "{}:", title)?;
    for (value, count) in entries {
        writeln!(f, "  {:<40} {}", value.to_string(), count)?;
    }
    Ok(())
}

impl fmt::Display for TopEntities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hosts: {}", self.hosts)?;
        write_section(f, "Vendors", &self.vendors)?;
        write_section(f, "Products", &self.products)?;
        write_section(f, "Ports", &self.ports)?;
        write_section(f, "Transports", &self.transports)?;
        write_section(f, "Countries", &self.countries)?;
        write_section(f, "Vulnerabilities", &self.vulnerabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Attribution, Confidence, Engine, HostAttributes, HostKey, Location, Port, Protocol,
        ScanFindings, ScanKind,
    };

    fn record(ip: &str, port: u16, vendor: &str, country: &str, vulns: &[&str]) -> HostRecord {
        let mut record = HostRecord::new(HostKey::new(ip.parse().unwrap(), port));
        record.attribution.push(Attribution {
            vendor: vendor.into(),
            product: "Widget".into(),
            engine: Engine::Shodan,
            query: "widget".into(),
            query_confidence: Confidence::Firm,
            vendor_confidence: Confidence::Firm,
        });
        record.sources.insert(
            Engine::Shodan,
            vec![HostAttributes {
                transport: Some("TCP".into()),
                location: Some(Location {
                    country: Some(country.into()),
                    ..Default::default()
                }),
                vulnerabilities: vulns.iter().map(|v| v.to_string()).collect(),
                ..Default::default()
            }],
        );
        record
    }

    #[test]
    fn test_collect_counts_once_per_record() {
        let mut a = record("198.51.100.1", 443, "Acme", "Germany", &["CVE-2021-0001"]);
        // scanned port equal to the key port is not double counted
        a.findings.insert(
            ScanKind::PortService,
            ScanFindings {
                ports: vec![Port::new(443, Protocol::Tcp), Port::new(80, Protocol::Tcp)],
                ..Default::default()
            },
        );
        let b = record("198.51.100.2", 443, "Acme", "France", &[]);
        let c = record("198.51.100.3", 22, "Globex", "Germany", &["CVE-2021-0001"]);

        let stats = RecordStats::collect(&[a, b, c]);
        assert_eq!(stats.hosts, 3);
        assert_eq!(stats.vulnerable, 2);
        assert_eq!(stats.ambiguous, 0);
        assert_eq!(stats.counts.vendors["Acme"], 2);
        assert_eq!(stats.counts.products["Widget"], 3);
        assert_eq!(stats.counts.ports[&443], 2);
        assert_eq!(stats.counts.ports[&80], 1);
        assert_eq!(stats.counts.transports["tcp"], 3);
        assert_eq!(stats.counts.countries["Germany"], 2);
        assert_eq!(stats.counts.vulnerabilities["CVE-2021-0001"], 2);
    }

    #[test]
    fn test_top_orders_by_count_then_value() {
        let records: Vec<HostRecord> = [
            ("198.51.100.1", "Initech"),
            ("198.51.100.2", "Acme"),
            ("198.51.100.3", "Globex"),
            ("198.51.100.4", "Globex"),
        ]
        .iter()
        .map(|(ip, vendor)| record(ip, 443, vendor, "Spain", &[]))
        .collect();

        let top = RecordStats::collect(&records).top(2);
        assert_eq!(
            top.vendors,
            vec![("Globex".to_string(), 2), ("Acme".to_string(), 1)]
        );
        assert_eq!(top.ports, vec![(443, 4)]);
    }

    #[test]
    fn test_display_skips_empty_sections() {
        let stats = RecordStats::collect(&[record("198.51.100.1", 502, "Acme", "Italy", &[])]);
        let text = stats.top(DEFAULT_TOP_ENTITIES).to_string();
        assert!(text.starts_with("Hosts: 1\n"));
        assert!(text.contains("Ports:\n  502"));
        assert!(!text.contains("Vulnerabilities"));
    }
}
