//! Grinder Core Library
//!
//! This library discovers Internet-facing devices through search-engine
//! backends (Shodan, Censys), deep-scans them with external tools and merges
//! the heterogeneous evidence into one confidence-resolved record per host.
//!
//! The pipeline is
//! **catalog → discovery → deduplication → merge → scan → merge → store**.
//!
//! # Modules
//!
//! - [`catalog`] - Vendor/product query catalog and confidence filters
//! - [`config`] - Run configuration and credentials
//! - [`discovery`] - Search backends and the collectors that drive them
//! - [`dedup`] - Grouping of raw hits by host
//! - [`resolve`] - Confidence-based attribution and record merging
//! - [`scan`] - Scan engines, worker pools and the dispatcher
//! - [`store`] - Concurrent host record store with persistence
//! - [`pipeline`] - Run coordinator
//! - [`stats`] - Entity statistics over records
//! - [`output`] - Export formatters (JSON, pairs, report)
//! - [`types`] - Core data structures
//! - [`ip_utils`] - Address scope classification
//!
//! # Example
//!
//! ```no_run
//! use grinder_core::{catalog::Catalog, config::RunConfig, pipeline::Pipeline};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::from_file("grinder.toml")?.apply_env_overrides()?;
//! let catalog = Catalog::load("queries.json")?;
//! let summary = Pipeline::new(config)?.run(&catalog).await?;
//! println!("hosts: {}", summary.hosts);
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod ip_utils;
pub mod output;
pub mod pipeline;
pub mod resolve;
pub mod scan;
pub mod stats;
pub mod store;
pub mod types;

pub use error::{Error, Result};
