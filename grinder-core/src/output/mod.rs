//! Output formatting modules for host records
//!
//! # Formats
//!
//! - **JSON** - JSON array of records
//! - **Pair** - Simple IP:port pairs
//! - **Report** - Human-readable per-host blocks
//!
//! # Examples
//!
//! ```no_run
//! use grinder_core::output::{export_records, OutputFormat};
//! use grinder_core::store::HostRecordStore;
//!
//! let store = HostRecordStore::load("results/all_results.json").unwrap();
//! export_records(&store.records(), OutputFormat::Pair, None).unwrap();
//! ```

pub mod common;
pub mod json;
pub mod pair;
pub mod report;

pub use common::OutputWriter;
pub use json::JsonFormatter;
pub use pair::PairFormatter;
pub use report::ReportFormatter;

use crate::error::Error;
use crate::types::HostRecord;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// JSON array
    #[default]
    Json,
    /// `ip:port` lines
    Pair,
    /// Per-host text blocks
    Report,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "pair" | "pairs" => Ok(OutputFormat::Pair),
            "report" | "text" => Ok(OutputFormat::Report),
            other => Err(Error::config(format!("unknown output format '{}'", other))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Json => "json",
            OutputFormat::Pair => "pair",
            OutputFormat::Report => "report",
        })
    }
}

/// Writes `records` in `format` to a file, or stdout when `destination` is
/// `None` or `-`
pub fn export_records(
    records: &[HostRecord],
    format: OutputFormat,
    destination: Option<&Path>,
) -> io::Result<()> {
    let writer = OutputWriter::open(destination)?;
    match format {
        OutputFormat::Json => {
            let mut formatter = JsonFormatter::with_writer(writer);
            formatter.start()?;
            for record in records {
                formatter.write_record(record)?;
            }
            formatter.end()
        }
        OutputFormat::Pair => {
            let mut formatter = PairFormatter::with_writer(writer);
            for record in records {
                formatter.write_record(record)?;
            }
            formatter.end()
        }
        OutputFormat::Report => {
            let mut formatter = ReportFormatter::with_writer(env!("CARGO_PKG_VERSION"), writer);
            formatter.start()?;
            for record in records {
                formatter.write_record(record)?;
            }
            formatter.end()
        }
    }
}
