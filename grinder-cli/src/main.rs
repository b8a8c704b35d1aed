//! Grinder - Internet device census CLI
//!
//! Runs the discovery, scan and merge pipeline of `grinder-core` and works
//! with the persisted results file.

mod args;

use args::{Cli, Command, ConfigArgs, ExportArgs, StatsArgs};
use clap::Parser;
use grinder_core::{
    catalog::CatalogLoader,
    config::RunConfig,
    output::export_records,
    pipeline::{Pipeline, Progress, RunSummary},
    stats::RecordStats,
    store::HostRecordStore,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // First Ctrl+C cancels the run and keeps partial results, the second exits
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            eprintln!("\nForce exiting...");
            process::exit(1);
        } else {
            eprintln!("\nCaught interrupt signal, saving partial results...");
            token.cancel();
        }
    }) {
        eprintln!("Error setting Ctrl-C handler: {}", e);
        process::exit(1);
    }

    if let Err(e) = run(cli, cancel).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

/// Main application logic
async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = args.load_config()?.apply_env_overrides()?;
            run_pipeline(&args.common, config, cancel, false).await
        }
        Command::Rescan(args) => {
            let config = args.common.load_config()?.apply_env_overrides()?;
            run_pipeline(&args.common, config, cancel, true).await
        }
        Command::Stats(args) => stats(&args),
        Command::Export(args) => export(&args),
    }
}

async fn run_pipeline(
    common: &ConfigArgs,
    config: RunConfig,
    cancel: CancellationToken,
    rescan: bool,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let catalog = CatalogLoader::with_scripts_dir(&config.scripts_dir).load(&common.queries)?;
    let results_path = config.results_path();
    info!(
        queries = %common.queries.display(),
        results = %results_path.display(),
        scans = ?config.scan_kinds,
        "configuration loaded"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(config)?
        .with_cancellation(cancel)
        .with_progress(tx);
    let monitor = spawn_progress(rx, common.bar);

    println!(
        "Starting Grinder {} with {} vendor entries ({} queries)",
        env!("CARGO_PKG_VERSION"),
        catalog.len(),
        catalog.query_count()
    );

    let result = if rescan {
        pipeline.rescan(&catalog).await
    } else {
        pipeline.run(&catalog).await
    };
    let records = pipeline.store().len();
    drop(pipeline);
    let _ = monitor.await;

    let summary = result?;
    print_summary(&summary);
    println!(
        "Grinder done: {} records in {} ({:.2} seconds)",
        records,
        results_path.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Drives the progress bar (or plain status lines) from pipeline events
fn spawn_progress(mut rx: mpsc::UnboundedReceiver<Progress>, bar: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut progress_bar: Option<ProgressBar> = None;
        while let Some(event) = rx.recv().await {
            match event {
                Progress::DiscoveryFinished { engine, hits } => {
                    println!("{}: {} hits", engine, hits);
                }
                Progress::HostsMerged(hosts) => {
                    println!("Merged {} hosts", hosts);
                }
                Progress::ScansPlanned(total) => {
                    println!("Scanning: {} tasks", total);
                    if bar {
                        let pb = ProgressBar::new(total as u64);
                        if let Ok(style) = ProgressStyle::default_bar().template(
                            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                        ) {
                            pb.set_style(style.progress_chars("#>-"));
                        }
                        pb.set_draw_target(ProgressDrawTarget::stdout());
                        progress_bar = Some(pb);
                    }
                }
                Progress::ScanFinished { key, kind, status } => {
                    if let Some(ref pb) = progress_bar {
                        pb.set_message(format!("{} {} {}", key, kind, status));
                        pb.inc(1);
                    }
                }
            }
        }
        if let Some(pb) = progress_bar {
            pb.finish_with_message("Done");
        }
    })
}

fn print_summary(summary: &RunSummary) {
    for disabled in &summary.disabled_backends {
        println!("Backend {} disabled: {}", disabled.engine, disabled.reason);
    }
    for warning in &summary.warnings {
        println!("Warning: {}", warning);
    }
    println!(
        "Queries: {} run, {} skipped; hits: {}; hosts: {} ({} ambiguous)",
        summary.queries_run,
        summary.queries_skipped,
        summary.hits,
        summary.hosts,
        summary.ambiguous_hosts.len()
    );
    if summary.scans_planned > 0 {
        println!(
            "Scans: {} planned, {} succeeded, {} failed, {} timed out, {} cancelled",
            summary.scans_planned,
            summary.scans_succeeded,
            summary.failed_scans.len(),
            summary.timed_out_scans.len(),
            summary.cancelled_scans.len()
        );
        if summary.scans_unsuccessful() == 0 {
            println!("All scans succeeded");
        }
        for (label, issues) in [
            ("failed", &summary.failed_scans),
            ("timeout", &summary.timed_out_scans),
        ] {
            for issue in issues {
                let script = issue
                    .script
                    .as_deref()
                    .map(|s| format!(" {}", s))
                    .unwrap_or_default();
                println!(
                    "  {} {} {}{}: {}",
                    label,
                    issue.key,
                    issue.kind,
                    script,
                    issue.error.as_deref().unwrap_or("-")
                );
            }
        }
    }
    if summary.cancelled {
        println!("Run was cancelled; partial results were saved");
    }
}

fn stats(args: &StatsArgs) -> anyhow::Result<()> {
    let store = HostRecordStore::load(&args.input)?;
    let stats = RecordStats::collect(&store.records());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "{} hosts, {} vulnerable, {} ambiguous",
            stats.hosts, stats.vulnerable, stats.ambiguous
        );
        print!("{}", stats.top(args.top));
    }
    Ok(())
}

fn export(args: &ExportArgs) -> anyhow::Result<()> {
    let store = HostRecordStore::load(&args.input)?;
    let records = store.query(&args.record_query());
    export_records(&records, args.format, args.output.as_deref())?;
    if let Some(path) = &args.output {
        eprintln!("Exported {} records to {}", records.len(), path.display());
    }
    Ok(())
}
