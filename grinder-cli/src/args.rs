//! Command-line arguments

use clap::{Args, Parser, Subcommand};
use grinder_core::config::{RunConfig, CENSYS_FREE_PLAN_RESULTS};
use grinder_core::output::OutputFormat;
use grinder_core::stats::DEFAULT_TOP_ENTITIES;
use grinder_core::store::RecordQuery;
use grinder_core::types::{Confidence, Engine, ScanKind};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "grinder",
    version,
    about = "Discover Internet-facing devices, deep-scan them and merge the evidence per host"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover hosts from the query catalog, scan them and merge results
    Run(RunArgs),
    /// Re-run scans over the hosts already in the results file
    Rescan(RescanArgs),
    /// Print entity statistics of the results file
    Stats(StatsArgs),
    /// Export records from the results file
    Export(ExportArgs),
}

/// Options shared by every command that builds a pipeline
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Query catalog
    #[arg(short = 'q', long, default_value = "queries.json")]
    pub queries: PathBuf,

    /// Directory holding the results file
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Scan kinds to run (port-service, vulnerability, tls, nse-script, python-script)
    #[arg(short = 's', long = "scan", value_parser = parse_scan_kind)]
    pub scans: Vec<ScanKind>,

    /// Workers in the nmap-class pool
    #[arg(long)]
    pub nmap_workers: Option<usize>,

    /// Workers in the vulners-class pool
    #[arg(long)]
    pub vulners_workers: Option<usize>,

    /// Base nmap arguments
    #[arg(long)]
    pub nmap_args: Option<String>,

    /// Record but do not scan hosts outside public address space
    #[arg(long)]
    pub skip_non_global: bool,

    /// Show a progress bar for scans
    #[arg(long)]
    pub bar: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Shodan API key (falls back to SHODAN_API_KEY)
    #[arg(long)]
    pub shodan_key: Option<String>,

    /// Censys API id (falls back to CENSYS_API_ID)
    #[arg(long)]
    pub censys_id: Option<String>,

    /// Censys API secret (falls back to CENSYS_API_SECRET)
    #[arg(long)]
    pub censys_secret: Option<String>,

    /// Only query these vendors (substring match, repeatable)
    #[arg(long = "vendor")]
    pub vendors: Vec<String>,

    /// Minimum vendor confidence
    #[arg(long, value_parser = parse_confidence)]
    pub vendor_confidence: Option<Confidence>,

    /// Minimum query confidence
    #[arg(long, value_parser = parse_confidence)]
    pub query_confidence: Option<Confidence>,

    /// Result cap per Shodan query
    #[arg(long)]
    pub shodan_max_results: Option<usize>,

    /// Result cap per Censys query
    #[arg(long)]
    pub censys_max_results: Option<usize>,

    /// Censys free plan (caps results per query)
    #[arg(long)]
    pub censys_free_plan: bool,
}

#[derive(Debug, Args)]
pub struct RescanArgs {
    #[command(flatten)]
    pub common: ConfigArgs,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    /// Results file
    #[arg(short, long, default_value = "results/all_results.json")]
    pub input: PathBuf,

    /// Entries shown per entity
    #[arg(long, default_value_t = DEFAULT_TOP_ENTITIES)]
    pub top: usize,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Results file
    #[arg(short, long, default_value = "results/all_results.json")]
    pub input: PathBuf,

    /// Output format (json, pair, report)
    #[arg(short, long, default_value = "json", value_parser = parse_format)]
    pub format: OutputFormat,

    /// Output file, stdout when omitted or "-"
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Vendor filter (substring)
    #[arg(long)]
    pub vendor: Option<String>,

    /// Product filter (substring)
    #[arg(long)]
    pub product: Option<String>,

    /// Country filter
    #[arg(long)]
    pub country: Option<String>,

    /// Only hosts reported by this backend (shodan, censys)
    #[arg(long, value_parser = parse_engine)]
    pub engine: Option<Engine>,

    /// Only hosts with known vulnerabilities
    #[arg(long)]
    pub vulnerable: bool,

    /// Only hosts with ambiguous attribution
    #[arg(long)]
    pub ambiguous: bool,
}

impl ExportArgs {
    pub fn record_query(&self) -> RecordQuery {
        RecordQuery {
            vendor: self.vendor.clone(),
            product: self.product.clone(),
            country: self.country.clone(),
            engine: self.engine,
            vulnerable_only: self.vulnerable,
            ambiguous_only: self.ambiguous,
        }
    }
}

impl ConfigArgs {
    /// Loads the config file (or defaults) and applies the command-line overrides
    pub fn load_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(dir) = &self.results_dir {
            config.results_dir = dir.clone();
        }
        if !self.scans.is_empty() {
            config.scan_kinds = self.scans.iter().copied().collect();
        }
        if let Some(n) = self.nmap_workers {
            config.nmap_workers = n;
        }
        if let Some(n) = self.vulners_workers {
            config.vulners_workers = n;
        }
        if let Some(args) = &self.nmap_args {
            config.nmap_arguments = args.clone();
        }
        config.skip_non_global |= self.skip_non_global;
        Ok(config)
    }
}

impl RunArgs {
    /// Full run configuration including discovery options
    pub fn load_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = self.common.load_config()?;
        if self.shodan_key.is_some() {
            config.credentials.shodan_api_key = self.shodan_key.clone();
        }
        if self.censys_id.is_some() {
            config.credentials.censys_api_id = self.censys_id.clone();
        }
        if self.censys_secret.is_some() {
            config.credentials.censys_api_secret = self.censys_secret.clone();
        }
        if !self.vendors.is_empty() {
            config.vendors = self.vendors.clone();
        }
        if self.vendor_confidence.is_some() {
            config.vendor_confidence = self.vendor_confidence;
        }
        if self.query_confidence.is_some() {
            config.query_confidence = self.query_confidence;
        }
        if let Some(n) = self.shodan_max_results {
            config.shodan_max_results = n;
        }
        if let Some(n) = self.censys_max_results {
            config.censys_max_results = n;
        }
        if self.censys_free_plan {
            config.censys_max_results = config.censys_max_results.min(CENSYS_FREE_PLAN_RESULTS);
        }
        Ok(config)
    }
}

fn parse_scan_kind(s: &str) -> Result<ScanKind, String> {
    s.parse().map_err(|e: grinder_core::Error| e.to_string())
}

fn parse_confidence(s: &str) -> Result<Confidence, String> {
    s.parse().map_err(|e: grinder_core::Error| e.to_string())
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    s.parse().map_err(|e: grinder_core::Error| e.to_string())
}

fn parse_engine(s: &str) -> Result<Engine, String> {
    match s.to_ascii_lowercase().as_str() {
        "shodan" => Ok(Engine::Shodan),
        "censys" => Ok(Engine::Censys),
        other => Err(format!("unknown engine '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::try_parse_from([
            "grinder",
            "run",
            "--scan",
            "vulners",
            "-s",
            "tls",
            "--vendor",
            "acme",
            "--query-confidence",
            "firm",
            "--censys-free-plan",
            "--nmap-workers",
            "4",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.load_config().unwrap();
        assert!(config.scan_kinds.contains(&ScanKind::Vulnerability));
        assert!(config.scan_kinds.contains(&ScanKind::Tls));
        assert_eq!(config.vendors, vec!["acme"]);
        assert_eq!(config.query_confidence, Some(Confidence::Firm));
        assert_eq!(config.censys_max_results, CENSYS_FREE_PLAN_RESULTS);
        assert_eq!(config.nmap_workers, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Cli::try_parse_from(["grinder", "run", "--scan", "ping"]).is_err());
        assert!(Cli::try_parse_from(["grinder", "run", "--vendor-confidence", "high"]).is_err());
        assert!(Cli::try_parse_from(["grinder", "export", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_export_query() {
        let cli = Cli::try_parse_from([
            "grinder", "-v", "export", "--vendor", "acme", "--engine", "censys", "--vulnerable",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        let Command::Export(args) = cli.command else {
            panic!("expected export");
        };
        let query = args.record_query();
        assert_eq!(query.vendor.as_deref(), Some("acme"));
        assert_eq!(query.engine, Some(Engine::Censys));
        assert!(query.vulnerable_only);
        assert_eq!(args.format, OutputFormat::Json);
    }
}
