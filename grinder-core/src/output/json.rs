//! JSON output format

use crate::output::common::OutputWriter;
use crate::types::HostRecord;
use std::io;
use std::path::Path;

/// JSON output formatter
///
/// Streams host records as one JSON array, one record per line, so large
/// exports never hold the whole document in memory.
///
/// # Examples
///
/// ```no_run
/// use grinder_core::output::json::JsonFormatter;
///
/// let mut formatter = JsonFormatter::new();
/// formatter.start().unwrap();
/// // Add host records...
/// formatter.end().unwrap();
/// ```
pub struct JsonFormatter {
    writer: OutputWriter,
    first_done: bool,
}

impl JsonFormatter {
    /// Create a new JsonFormatter writing to stdout
    pub fn new() -> Self {
        Self::with_writer(OutputWriter::stdout())
    }

    /// Create a new JsonFormatter writing to a file
    pub fn new_with_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::with_writer(OutputWriter::file(path)?))
    }

    /// Create a new JsonFormatter on an existing writer
    pub fn with_writer(writer: OutputWriter) -> Self {
        Self {
            writer,
            first_done: false,
        }
    }

    /// Write the opening bracket
    pub fn start(&mut self) -> io::Result<()> {
        self.writer.write("[")
    }

    /// Write a host record
    pub fn write_record(&mut self, record: &HostRecord) -> io::Result<()> {
        let prefix = if self.first_done { ",\n" } else { "\n" };
        self.first_done = true;

        let json = serde_json::to_string(record).map_err(io::Error::other)?;
        self.writer.write(&format!("{}{}", prefix, json))
    }

    /// Write the closing bracket and flush
    pub fn end(&mut self) -> io::Result<()> {
        self.writer.write(if self.first_done { "\n]\n" } else { "]\n" })?;
        self.writer.flush()
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}
