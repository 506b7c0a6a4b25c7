//! dutsched CLI - Hardware-aware test sharding for device labs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use dutsched::config::{self, ExecutionConfig, InventoryConfig};
use dutsched::execution::{CommandExecutionService, JsonMaterializer};
use dutsched::inventory::FleetInventory;
use dutsched::inventory::command::CommandInventory;
use dutsched::inventory::declared::DeclaredInventory;
use dutsched::orchestrator::Orchestrator;
use dutsched::plan::{TestPlan, load_plan};
use dutsched::report::{ConsoleReporter, JsonReporter, MultiReporter, NullReporter};

#[derive(Parser)]
#[command(name = "dutsched")]
#[command(about = "Hardware-aware test sharding and dispatch for device labs", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dutsched.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shard and run a test plan
    Run {
        /// Test plan (JSON)
        #[arg(long)]
        plan: PathBuf,

        /// Override maximum concurrently executing shards
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Override the number of retry attempts
        #[arg(short, long)]
        retries: Option<u32>,

        /// JSON results output path
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Show how a test plan would be sharded, without running it
    Plan {
        /// Test plan (JSON)
        #[arg(long)]
        plan: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Inventory type (declared, command)
        #[arg(short, long, default_value = "declared")]
        inventory: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            plan,
            parallel,
            retries,
            json,
        } => run_plan(&cli.config, &plan, parallel, retries, json, cli.verbose).await,
        Commands::Plan { plan, format } => show_plan(&cli.config, &plan, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { inventory } => init_config(&inventory),
    }
}

async fn run_plan(
    config_path: &Path,
    plan_path: &Path,
    parallel_override: Option<usize>,
    retries_override: Option<u32>,
    json_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(parallel) = parallel_override {
        config.scheduler.max_parallel = parallel;
    }
    if let Some(retries) = retries_override {
        config.suite.retry_count = retries;
    }

    info!("Loaded configuration from {}", config_path.display());

    let plan = load_plan(plan_path)?;
    info!("Loaded {} tests for suite {:?}", plan.tests.len(), plan.suite);

    match config.inventory.clone() {
        InventoryConfig::Declared(cfg) => {
            run_with(config, DeclaredInventory::new(cfg), plan, json_path, verbose).await
        }
        InventoryConfig::Command(cfg) => {
            run_with(config, CommandInventory::new(cfg), plan, json_path, verbose).await
        }
    }
}

async fn run_with<I>(
    config: config::Config,
    inventory: I,
    plan: TestPlan,
    json_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()>
where
    I: FleetInventory + 'static,
{
    info!("Using inventory: {}", inventory.name());

    let ExecutionConfig::Command(execution) = config.execution.clone();
    let materializer = JsonMaterializer::new(execution.request_timeout_secs);
    let service = CommandExecutionService::new(execution);

    let reporter = create_reporter(&config, json_path, verbose);
    let orchestrator = Orchestrator::new(
        config,
        inventory,
        Arc::new(service),
        Arc::new(materializer),
        reporter,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling outstanding attempts");
                cancel.cancel();
            }
        });
    }

    let result = orchestrator.run_with_cancel(&plan, cancel).await;
    std::process::exit(result.exit_code());
}

async fn show_plan(config_path: &Path, plan_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let plan = load_plan(plan_path)?;

    match config.inventory.clone() {
        InventoryConfig::Declared(cfg) => {
            print_plan(config, DeclaredInventory::new(cfg), &plan, format).await
        }
        InventoryConfig::Command(cfg) => {
            print_plan(config, CommandInventory::new(cfg), &plan, format).await
        }
    }
}

async fn print_plan<I: FleetInventory>(
    config: config::Config,
    inventory: I,
    plan: &TestPlan,
    format: &str,
) -> Result<()> {
    let ExecutionConfig::Command(execution) = config.execution.clone();
    let materializer = JsonMaterializer::new(execution.request_timeout_secs);
    let orchestrator = Orchestrator::new(
        config,
        inventory,
        Arc::new(CommandExecutionService::new(execution)),
        Arc::new(materializer),
        NullReporter,
    );

    let planned = orchestrator.plan(plan).await;
    let distribution = &planned.distribution;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&planned.summary(&plan.suite))?;
            println!("{}", json);
        }
        _ => {
            println!(
                "Suite {:?}: {} tests in {} shards",
                plan.suite,
                plan.tests.len(),
                distribution.shard_count()
            );
            for device in distribution.assignment.devices() {
                let shards = distribution.assignment.shards_for(device);
                println!("  {} ({} shards)", device, shards.len());
                if let Some(config) = planned.table.config(device) {
                    println!("    hardware: {}", config);
                }
                println!(
                    "    devices: {} total, {} ready left",
                    planned.lab.total(device),
                    planned.lab.remaining(device)
                );
                for shard in shards {
                    println!("    {} [{}]: {} tests", shard.key, shard.harness, shard.tests.len());
                }
            }
            if !distribution.queued.is_empty() {
                println!("Queued without a ready device: {}", distribution.queued.join(", "));
            }
            for unmatched in &distribution.unmatched {
                println!(
                    "Unmatched {} [{}]: {} tests",
                    unmatched.key,
                    unmatched.harness,
                    unmatched.tests.len()
                );
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Pool: {}", config.suite.pool);
            println!("  Max tests per shard: {}", config.suite.max_in_shard);
            println!("  Retry count: {}", config.suite.retry_count);
            println!("  Max parallel: {}", config.scheduler.max_parallel);
            println!("  Run timeout: {}s", config.scheduler.timeout_secs);

            let inventory = match &config.inventory {
                InventoryConfig::Declared(cfg) => format!("declared ({} devices)", cfg.devices.len()),
                InventoryConfig::Command(_) => "command".to_string(),
            };
            println!("  Inventory: {}", inventory);

            let execution = match &config.execution {
                ExecutionConfig::Command(_) => "command",
            };
            println!("  Execution: {}", execution);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(inventory: &str) -> Result<()> {
    let inventory_config = match inventory {
        "declared" => {
            r#"[inventory]
type = "declared"
# Only declared devices are candidates for placement
catalog = true

[[inventory.devices]]
board = "octopus"
model = "fleex"
pool = "DUT_POOL_QUOTA"
ready = 4
total = 5"#
        }
        "command" => {
            r#"[inventory]
type = "command"
# Prints the number of devices matching the JSON dimensions
command = "./scripts/bot-count.sh '{dimensions}'"
timeout_secs = 60"#
        }
        _ => {
            eprintln!("Unknown inventory: {}. Use: declared, command", inventory);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# dutsched configuration file

[suite]
pool = "DUT_POOL_QUOTA"
max_in_shard = 50
retry_count = 1

[scheduler]
max_parallel = 100
poll_interval_secs = 30
timeout_secs = 86400

{}

[execution]
type = "command"
# Receives the request JSON file, prints the job id
schedule_command = "./scripts/schedule.sh {{request_file}}"
# Prints the job status (pending, running, completed, failed, cancelled)
status_command = "./scripts/status.sh {{job_id}}"
# Writes the gzipped result JSON to the output file
fetch_command = "./scripts/fetch.sh {{job_id}} {{output_file}}"

[report]
output_dir = "dutsched-results"
json = true
json_file = "results.json"
"#,
        inventory_config
    );

    let path = PathBuf::from("dutsched.toml");
    if path.exists() {
        eprintln!("dutsched.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created dutsched.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  dutsched run --plan plan.json");

    Ok(())
}

fn create_reporter(
    config: &config::Config,
    json_override: Option<PathBuf>,
    verbose: bool,
) -> MultiReporter {
    let mut multi = MultiReporter::new();

    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    if config.report.json || json_override.is_some() {
        let json_path =
            json_override.unwrap_or_else(|| config.report.output_dir.join(&config.report.json_file));
        multi = multi.with_reporter(JsonReporter::new(json_path));
    }

    multi
}
