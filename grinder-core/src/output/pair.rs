//! IP:port pairs output format

use crate::output::common::OutputWriter;
use crate::types::{HostKey, HostRecord};
use std::collections::BTreeSet;
use std::io;
use std::path::Path;

/// Pair output formatter
///
/// Produces `ip:port` pairs, one per line: the record's own port followed by
/// any other open port a scan found on the same address.
///
/// # Examples
///
/// ```no_run
/// use grinder_core::output::pair::PairFormatter;
///
/// let mut formatter = PairFormatter::new();
/// // Add host records...
/// ```
pub struct PairFormatter {
    writer: OutputWriter,
}

impl PairFormatter {
    /// Create a new PairFormatter writing to stdout
    pub fn new() -> Self {
        Self::with_writer(OutputWriter::stdout())
    }

    /// Create a new PairFormatter writing to a file
    pub fn new_with_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::with_writer(OutputWriter::file(path)?))
    }

    /// Create a new PairFormatter on an existing writer
    pub fn with_writer(writer: OutputWriter) -> Self {
        Self { writer }
    }

    /// Write a host record
    pub fn write_record(&mut self, record: &HostRecord) -> io::Result<()> {
        let mut ports = BTreeSet::new();
        ports.insert(record.key.port);
        ports.extend(
            record
                .findings
                .values()
                .flat_map(|f| f.ports.iter().map(|p| p.number)),
        );

        for port in ports {
            let key = HostKey::new(record.key.ip, port);
            self.writer.write(&format!("{}\n", key))?;
        }
        Ok(())
    }

    /// Flush buffered output
    pub fn end(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Default for PairFormatter {
    fn default() -> Self {
        Self::new()
    }
}
