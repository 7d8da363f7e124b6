//! Refinery CLI - process raw files into bronze/silver/gold tables
//!
//! # Main Commands
//!
//! ```bash
//! refinery run                       # Discover new files and advance every batch
//! refinery run --batches 3..5        # Backfill a batch range (no discovery)
//! refinery status                    # Batch manifest
//! refinery show gold                 # Dump a table as JSON
//! refinery rebuild-gold              # Recompute Gold from Silver
//! refinery serve                     # HTTP trigger (port 3000)
//! ```
//!
//! # Debug Commands
//!
//! ```bash
//! refinery schema                    # Cleaned contract as JSON Schema
//! refinery schema --raw              # Raw contract as JSON Schema
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use refinery::logging::{init_logging, LogConfig, LogFormat};
use refinery::{BatchRange, CancelFlag, Pipeline, PipelineConfig, RunOptions, RunResult, TableName};

#[derive(Parser)]
#[command(name = "refinery", version)]
#[command(about = "Layered bronze/silver/gold batch transformation engine", long_about = None)]
struct Cli {
    /// Pipeline config file (TOML). Built-in defaults when omitted.
    #[arg(short, long, global = true, env = "REFINERY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true, env = "REFINERY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override the landing directory
    #[arg(long, global = true, env = "REFINERY_LANDING_DIR")]
    landing_dir: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process new data: discovery, then Bronze → Silver → Gold per batch
    Run {
        /// Recompute all of Gold after the batches
        #[arg(long)]
        full_gold_rebuild: bool,

        /// Only advance these batches (`N` or `FIRST..LAST`); skips discovery
        #[arg(long, value_parser = parse_batch_range)]
        batches: Option<BatchRange>,

        /// Print the run result as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Show the batch manifest
    Status {
        /// Print the manifest as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Dump a table (bronze, silver, gold, quarantine, manifest) as JSON
    Show {
        table: TableName,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Recompute every Gold row from the current Silver table
    RebuildGold,

    /// Print the cleaned (or raw) contract as JSON Schema
    Schema {
        #[arg(long)]
        raw: bool,
    },

    /// Start the HTTP trigger
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "REFINERY_PORT")]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format));

    let result = match load_config(&cli) {
        Ok(config) => dispatch(cli.command, config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            std::process::exit(2);
        }
    }
}

/// Runs a command. `Ok(false)` means it finished but something needs attention.
async fn dispatch(command: Commands, config: PipelineConfig) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Commands::Run {
            full_gold_rebuild,
            batches,
            json,
        } => {
            let options = RunOptions {
                full_gold_rebuild,
                batch_range: batches,
            };
            cmd_run(config, options, json).await
        }
        Commands::Status { json } => cmd_status(config, json).await.map(|_| true),
        Commands::Show { table, output } => cmd_show(config, table, output.as_deref()).await.map(|_| true),
        Commands::RebuildGold => cmd_rebuild_gold(config).await.map(|_| true),
        Commands::Schema { raw } => cmd_schema(&config, raw).map(|_| true),
        Commands::Serve { port } => {
            let pipeline = Pipeline::from_config(config)?;
            refinery::server::start_server(pipeline, port).await.map(|_| true)
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.landing_dir {
        config.storage.landing_dir = dir.clone();
    }
    Ok(config)
}

/// Pipeline calls are synchronous; keep them off the async workers.
async fn blocking<T, F>(config: PipelineConfig, f: F) -> Result<T, Box<dyn std::error::Error>>
where
    T: Send + 'static,
    F: FnOnce(&Pipeline) -> Result<T, refinery::PipelineError> + Send + 'static,
{
    let pipeline = Pipeline::from_config(config)?;
    let value = tokio::task::spawn_blocking(move || f(&pipeline)).await??;
    Ok(value)
}

async fn cmd_run(config: PipelineConfig, options: RunOptions, json: bool) -> Result<bool, Box<dyn std::error::Error>> {
    eprintln!("📂 Landing: {}", config.storage.landing_dir.display());
    eprintln!("🗄️  Data:    {}", config.storage.data_dir.display());

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⏹️  Cancelling after the current stage...");
            on_signal.cancel();
        }
    });

    let result = blocking(config, move |p| p.run(&options, &cancel)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    print_run_summary(&result);
    Ok(result.is_success())
}

fn print_run_summary(result: &RunResult) {
    eprintln!("\n{}", "=".repeat(60));
    eprintln!("📊 RUN {}", result.run_id);
    eprintln!("{}", "=".repeat(60));
    eprintln!("   Committed:  {:?}", result.committed_batches);
    if !result.skipped_files.is_empty() {
        eprintln!("   Skipped:    {}", result.skipped_files.join(", "));
    }
    if !result.contended_batches.is_empty() {
        eprintln!("   Contended:  {:?}", result.contended_batches);
    }
    if result.gold_rebuilt {
        eprintln!("   Gold:       rebuilt");
    }
    for failed in &result.failed_batches {
        eprintln!("   ❌ Batch {} failed at {}: {}", failed.batch_id, failed.stage, failed.reason);
    }
    if result.aborted {
        eprintln!("   ⏹️  Run cancelled");
    } else if result.is_success() {
        eprintln!("\n✨ Done!");
    }
}

async fn cmd_status(config: PipelineConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = blocking(config, |p| p.status()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }
    if manifest.batches.is_empty() {
        eprintln!("📋 No batches yet.");
        return Ok(());
    }

    eprintln!("📋 Batches ({}):\n", manifest.batches.len());
    for batch in manifest.batches.values() {
        println!("  {:>6}  {:<18} {}", batch.batch_id, batch.state().to_string(), batch.source_file);
        for (stage, outcome) in &batch.stages {
            let detail = match &outcome.error {
                Some(error) => format!("error: {}", error),
                None => format!("{} rows, {} rejected", outcome.row_count, outcome.rejected_count),
            };
            println!("          {:<7} {} (attempt {})", stage.to_string(), detail, outcome.attempts);
        }
    }
    Ok(())
}

async fn cmd_show(config: PipelineConfig, table: TableName, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let rows = blocking(config, move |p| p.table(table)).await?;
    let json = serde_json::to_string_pretty(&rows)?;
    write_output(&json, output)
}

async fn cmd_rebuild_gold(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = blocking(config, |p| p.rebuild_gold()).await?;
    eprintln!(
        "✅ Gold rebuilt: {} groups, {} written, {} removed",
        outcome.groups, outcome.written, outcome.removed
    );
    Ok(())
}

fn cmd_schema(config: &PipelineConfig, raw: bool) -> Result<(), Box<dyn std::error::Error>> {
    let schema = if raw { &config.raw_schema } else { &config.cleaned_schema };
    println!("{}", serde_json::to_string_pretty(&schema.to_json_schema())?);
    Ok(())
}

fn write_output(content: &str, path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            fs::write(p, content)?;
            eprintln!("💾 Output written to: {}", p.display());
        }
        None => {
            println!("{}", content);
        }
    }
    Ok(())
}

/// `7` or `3..7` (inclusive).
fn parse_batch_range(s: &str) -> Result<BatchRange, String> {
    let parse = |v: &str| {
        v.trim()
            .parse::<u64>()
            .map_err(|_| format!("'{}' is not a batch id", v.trim()))
    };
    let (first, last) = match s.split_once("..") {
        Some((a, b)) => (parse(a)?, parse(b.trim_start_matches('='))?),
        None => {
            let id = parse(s)?;
            (id, id)
        }
    };
    if first > last {
        return Err(format!("range start {} is after end {}", first, last));
    }
    Ok(BatchRange { first, last })
}
