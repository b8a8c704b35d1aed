//! Common utilities for output formatting

use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Output writer that can write to stdout or a file
pub struct OutputWriter {
    file: Option<io::BufWriter<std::fs::File>>,
    destination: String,
}

impl OutputWriter {
    /// Create a new OutputWriter for stdout
    pub fn stdout() -> Self {
        Self {
            file: None,
            destination: "-".to_string(),
        }
    }

    /// Create a new OutputWriter for a file, truncating it
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path_str = path.as_ref().display().to_string();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            file: Some(io::BufWriter::new(file)),
            destination: path_str,
        })
    }

    /// Opens stdout for `-` or `None`, a file otherwise
    pub fn open(destination: Option<&Path>) -> io::Result<Self> {
        match destination {
            Some(path) if path.as_os_str() != "-" => Self::file(path),
            _ => Ok(Self::stdout()),
        }
    }

    /// Write a string to the output
    pub fn write(&mut self, s: &str) -> io::Result<()> {
        if let Some(ref mut f) = self.file {
            f.write_all(s.as_bytes())
        } else {
            print!("{}", s);
            Ok(())
        }
    }

    /// Flush buffered output
    pub fn flush(&mut self) -> io::Result<()> {
        match self.file {
            Some(ref mut f) => f.flush(),
            None => io::stdout().flush(),
        }
    }

    /// Get the destination (file path or "-" for stdout)
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// Formats a record timestamp, e.g. "2024-03-01 12:30:00 UTC"
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Pad a string with spaces on the right
pub fn pad_right(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        s.to_string()
    } else {
        format!("{}{}", s, " ".repeat(width - len))
    }
}
