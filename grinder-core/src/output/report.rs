//! Human-readable per-host report

use crate::output::common::{format_timestamp, pad_right, OutputWriter};
use crate::types::{HostRecord, Protocol, ScanStatus};
use std::io;
use std::path::Path;

/// Report output formatter
///
/// One block per host: attribution, location, banners, scan findings and the
/// status of scans that did not succeed.
///
/// # Examples
///
/// ```no_run
/// use grinder_core::output::report::ReportFormatter;
///
/// let mut formatter = ReportFormatter::new("0.1.0");
/// formatter.start().unwrap();
/// // Add host records...
/// ```
pub struct ReportFormatter {
    writer: OutputWriter,
    version: String,
}

impl ReportFormatter {
    /// Create a new ReportFormatter writing to stdout
    pub fn new(version: &str) -> Self {
        Self::with_writer(version, OutputWriter::stdout())
    }

    /// Create a new ReportFormatter writing to a file
    pub fn new_with_file(version: &str, path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::with_writer(version, OutputWriter::file(path)?))
    }

    /// Create a new ReportFormatter on an existing writer
    pub fn with_writer(version: &str, writer: OutputWriter) -> Self {
        Self {
            writer,
            version: version.to_string(),
        }
    }

    /// Write the header
    pub fn start(&mut self) -> io::Result<()> {
        self.writer
            .write(&format!("\n\tGrinder ({})\n", self.version))
    }

    /// Write a host record
    pub fn write_record(&mut self, record: &HostRecord) -> io::Result<()> {
        self.writer.write(&render_record(record))
    }

    /// Flush buffered output
    pub fn end(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Renders one record block
pub fn render_record(record: &HostRecord) -> String {
    let mut output = String::new();

    let hostnames: Vec<&str> = record
        .sources
        .values()
        .flatten()
        .flat_map(|attrs| attrs.hostnames.iter().map(String::as_str))
        .collect();
    if hostnames.is_empty() {
        output.push_str(&format!("\n+ {}\n", record.key));
    } else {
        output.push_str(&format!("\n+ {} ({})\n", record.key, hostnames.join(", ")));
    }

    for attribution in &record.attribution {
        output.push_str(&format!(
            "  - {}: {} {} (query {}, vendor {})\n",
            pad_right(attribution.engine.as_str(), 6),
            attribution.vendor,
            attribution.product,
            attribution.query_confidence,
            attribution.vendor_confidence,
        ));
    }
    if record.ambiguous {
        output.push_str("  - Attribution: ambiguous\n");
    }

    if let Some(country) = record.country() {
        output.push_str(&format!("  - Country: {}\n", country));
    }

    for banner in &record.banners {
        let first_line = banner.lines().next().unwrap_or_default();
        output.push_str(&format!("  - Banner: {}\n", first_line.trim()));
    }

    let ports: Vec<_> = record.findings.values().flat_map(|f| f.ports.iter()).collect();
    if !ports.is_empty() {
        output.push_str("  + Ports:\n");
        for port in ports {
            let protocol = match port.protocol {
                Protocol::Tcp => "tcp",
                Protocol::Udp => "udp",
            };
            output.push_str(&format!("    - {} {}", port.number, protocol));
            if let Some(ref service) = port.service {
                output.push_str(&format!("/{}", service.name));
                if let Some(ref product) = service.product {
                    output.push_str(&format!(" {}", product));
                }
            }
            output.push('\n');
        }
    }

    let tls_attacks: Vec<&str> = record
        .findings
        .values()
        .filter_map(|f| f.tls.as_ref())
        .flat_map(|tls| tls.vulnerable_attacks())
        .collect();
    if !tls_attacks.is_empty() {
        output.push_str(&format!("  - TLS: {}\n", tls_attacks.join(", ")));
    }

    let vulns = record.vulnerabilities();
    if !vulns.is_empty() {
        output.push_str(&format!("  - Vulns: {}\n", vulns.join(", ")));
    }

    for (kind, entry) in &record.scan_status {
        if entry.status != ScanStatus::Success {
            output.push_str(&format!("  - Scan {}: {}", kind, entry.status));
            if let Some(ref error) = entry.error {
                output.push_str(&format!(" ({})", error));
            }
            output.push('\n');
        }
    }

    for (kind, runs) in &record.scripts {
        for (script, run) in runs {
            if run.status.status != ScanStatus::Success {
                output.push_str(&format!("  - Script {} {}: {}", kind, script, run.status.status));
                if let Some(ref error) = run.status.error {
                    output.push_str(&format!(" ({})", error));
                }
                output.push('\n');
            }
        }
    }

    output.push_str(&format!(
        "  - Updated: {}\n",
        format_timestamp(&record.last_updated)
    ));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Attribution, Confidence, Engine, HostAttributes, HostKey, Location, Port, ScanFindings,
        ScanKind, ScanStatusEntry, ScriptRun, Service, TlsFindings,
    };

    fn sample() -> HostRecord {
        let mut record = HostRecord::new(HostKey::new("203.0.113.7".parse().unwrap(), 443));
        record.attribution.push(Attribution {
            vendor: "Acme".into(),
            product: "Widget".into(),
            engine: Engine::Censys,
            query: "services.software.product: widget".into(),
            query_confidence: Confidence::Certain,
            vendor_confidence: Confidence::Firm,
        });
        record.sources.insert(
            Engine::Shodan,
            vec![HostAttributes {
                hostnames: vec!["widget.example.com".into()],
                location: Some(Location {
                    country: Some("Netherlands".into()),
                    ..Default::default()
                }),
                vulnerabilities: vec!["CVE-2021-44228".into()],
                ..Default::default()
            }],
        );
        record.banners.push("HTTP/1.1 200 OK\r\nServer: widget".into());

        let mut tls = TlsFindings::default();
        tls.attacks.insert("Heartbleed".into(), true);
        tls.attacks.insert("Poodle".into(), false);
        record.findings.insert(
            ScanKind::PortService,
            ScanFindings {
                ports: vec![Port::with_service(
                    443,
                    Protocol::Tcp,
                    Service::new("https").with_product("widgetd 2.1"),
                )],
                ..Default::default()
            },
        );
        record.findings.insert(
            ScanKind::Tls,
            ScanFindings {
                tls: Some(tls),
                ..Default::default()
            },
        );
        record.scan_status.insert(
            ScanKind::Vulnerability,
            ScanStatusEntry {
                status: ScanStatus::Timeout,
                attempts: 1,
                error: Some("scan timed out after 120s".into()),
            },
        );
        let mut runs = std::collections::BTreeMap::new();
        runs.insert(
            "widget-info.nse".to_string(),
            ScriptRun {
                status: ScanStatusEntry {
                    status: ScanStatus::Success,
                    attempts: 1,
                    error: None,
                },
                output: Some(serde_json::json!({"version": "2.1"})),
            },
        );
        runs.insert(
            "widget-auth.nse".to_string(),
            ScriptRun {
                status: ScanStatusEntry {
                    status: ScanStatus::Failed,
                    attempts: 2,
                    error: Some("script exited with status 1".into()),
                },
                output: None,
            },
        );
        record.scripts.insert(ScanKind::NseScript, runs);
        record
    }

    #[test]
    fn test_render_record() {
        let text = render_record(&sample());
        assert!(text.contains("+ 203.0.113.7:443 (widget.example.com)"));
        assert!(text.contains("censys: Acme Widget (query certain, vendor firm)"));
        assert!(text.contains("Country: Netherlands"));
        assert!(text.contains("Banner: HTTP/1.1 200 OK\n"));
        assert!(text.contains("443 tcp/https widgetd 2.1"));
        assert!(text.contains("TLS: Heartbleed\n"));
        assert!(text.contains("Vulns: CVE-2021-44228"));
        assert!(text.contains("Scan vulnerability: timeout (scan timed out after 120s)"));
        assert!(text.contains("Script nse_script widget-auth.nse: failed (script exited with status 1)"));
        assert!(!text.contains("widget-info.nse"));
        assert!(!text.contains("ambiguous"));
    }

    #[test]
    fn test_render_bare_record() {
        let record = HostRecord::new(HostKey::new("198.51.100.4".parse().unwrap(), 22));
        let text = render_record(&record);
        assert!(text.starts_with("\n+ 198.51.100.4:22\n"));
        assert!(!text.contains("Ports"));
    }

    #[test]
    fn test_report_formatter_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let mut formatter = ReportFormatter::new_with_file("0.1.0", &path).unwrap();
        formatter.start().unwrap();
        formatter.write_record(&sample()).unwrap();
        formatter.end().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("\n\tGrinder (0.1.0)\n"));
        assert!(content.contains("203.0.113.7:443"));
    }
}
