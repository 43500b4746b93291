use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use catalog_fusion::config::PipelineConfig;
use catalog_fusion::logging;
use catalog_fusion::pipeline::export::{export_all, export_relation};
use catalog_fusion::pipeline::ingestion::load_raw_sources;
use catalog_fusion::pipeline::storage::PipelineStore;
use catalog_fusion::pipeline::summary::PipelineSummary;
use catalog_fusion::pipeline::{Pipeline, StageName, StageSummary};

#[derive(Parser)]
#[command(name = "catalog_fusion")]
#[command(about = "Reconcile ERP inventory with the web catalog through validated stages")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to a TOML config file (defaults to ./catalog_fusion.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the pipeline store location
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load erp.csv, web.csv and liaison.csv into the raw relations
    Load {
        /// Directory holding the three source files
        #[arg(long)]
        raw_dir: Option<PathBuf>,
    },
    /// Run a range of stages (all of them by default)
    Run {
        /// First stage to run
        #[arg(long, value_enum)]
        from: Option<StageName>,
        /// Last stage to run
        #[arg(long, value_enum)]
        to: Option<StageName>,
    },
    /// Run a single stage against the current store
    Stage {
        #[arg(value_enum)]
        name: StageName,
    },
    /// Export one relation as CSV
    Export {
        relation: String,
        /// Output file (defaults to <export_dir>/<relation>.csv)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export every stored relation as CSV
    ExportAll {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show relation counts, the revenue total and recent stage runs
    Summary,
    /// Copy the whole store to a new file
    Snapshot {
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() {
    if let Err(e) = run() {
        error!("{:#}", e);
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    // Keep the guard alive so file logs are flushed on exit
    let _log_guard = logging::init_logging(&config.log_dir);
    info!(store = %config.store_path.display(), "Configuration loaded");

    let mut store = PipelineStore::open(&config.store_path)
        .with_context(|| format!("opening store {}", config.store_path.display()))?;

    match cli.command {
        Commands::Load { raw_dir } => {
            let raw_dir = raw_dir.unwrap_or_else(|| config.raw_dir.clone());
            println!("📥 Loading sources from {}", raw_dir.display());
            let reports = load_raw_sources(&mut store, &raw_dir)?;
            for r in reports {
                println!("   {:<12} {:>6} rows", r.relation, r.rows);
            }
            println!("✅ Load completed");
        }
        Commands::Run { from, to } => {
            let pipeline = Pipeline::new(config);
            let summaries = pipeline.run(&mut store, from, to)?;
            print_summaries(&summaries);
            println!("✅ Pipeline completed ({} stages)", summaries.len());
        }
        Commands::Stage { name } => {
            let pipeline = Pipeline::new(config);
            let summary = pipeline.run_stage(&mut store, name)?;
            print_summaries(&[summary]);
        }
        Commands::Export { relation, out } => {
            let out = out.unwrap_or_else(|| config.export_dir.join(format!("{}.csv", relation)));
            let rows = export_relation(&store, &relation, &out)?;
            println!("✅ Exported {} rows of {} to {}", rows, relation, out.display());
        }
        Commands::ExportAll { dir } => {
            let dir = dir.unwrap_or_else(|| config.export_dir.clone());
            for (relation, path, rows) in export_all(&store, &dir)? {
                println!("   {:<22} {:>6} rows -> {}", relation, rows, path.display());
            }
            println!("✅ Export completed");
        }
        Commands::Summary => {
            let summary = PipelineSummary::collect(&store, 10)?;
            print!("{}", summary.render());
        }
        Commands::Snapshot { out } => {
            store.snapshot_to(&out)?;
            println!("✅ Snapshot written to {}", out.display());
        }
    }
    Ok(())
}

fn print_summaries(summaries: &[StageSummary]) {
    for s in summaries {
        println!(
            "🔨 {:<9} {} invariants checked in {} ms",
            s.stage, s.invariants_checked, s.duration_ms
        );
        for (relation, rows) in &s.written {
            println!("   {:<22} {:>6} rows", relation, rows);
        }
    }
}
