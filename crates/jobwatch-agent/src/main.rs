//! Jobwatch: scheduled job-posting ingestion, scoring and alerting.

use std::path::PathBuf;
use std::sync::Arc;

use jobwatch_core::JobwatchConfig;
use jobwatch_runtime::{LogNotifier, Mode, Orchestrator, RunStatus};
use jobwatch_scoring::create_ai_scorer;
use jobwatch_sources::{AdapterRegistry, HttpClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn resolve_data_dir() -> PathBuf {
    std::env::var("JOBWATCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn print_help() {
    println!("Jobwatch: job-posting ingestion, dedup and scoring pipeline");
    println!();
    println!("Usage: jobwatch <command> [-v|--verbose]");
    println!();
    println!("Commands:");
    println!("  poll          Fetch all sources, score new postings, send alerts");
    println!("  digest        Send the digest of pending postings");
    println!("  cleanup       Expire stale postings and take a backup");
    println!("  health        Report store integrity, domain health and budget");
    println!("  acknowledge   Clear the degraded marker after reviewing data loss");
    println!("  help          Show this help message");
    println!();
    println!("Environment:");
    println!("  JOBWATCH_DATA_DIR   Data directory (default: ./data)");
    println!("  JOBWATCH_CONFIG     Config file (default: <data-dir>/jobwatch.json)");
    println!();
    println!("Exit codes: 0 success, 2 partial failure, 1 fatal");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    let command = args
        .iter()
        .find(|a| !a.starts_with('-'))
        .cloned()
        .unwrap_or_else(|| "help".to_string());

    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = match command.as_str() {
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        "acknowledge" => None,
        other => match Mode::parse(other) {
            Some(mode) => Some(mode),
            None => {
                eprintln!("Unknown command: {}. Use 'jobwatch help' for usage.", other);
                std::process::exit(RunStatus::Fatal.exit_code());
            }
        },
    };

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = match JobwatchConfig::load(&data_dir, None) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(RunStatus::Fatal.exit_code());
        }
    };

    let client = HttpClient::new(config.resilience.fetch_timeout())?;
    let registry = AdapterRegistry::with_defaults(client);
    let ai = create_ai_scorer(&config.ai);
    let orchestrator = Orchestrator::new(config, registry, ai, Arc::new(LogNotifier));

    let Some(mode) = mode else {
        orchestrator.acknowledge_data_loss()?;
        println!("Data loss acknowledged; runs may resume");
        return Ok(());
    };

    let outcome = orchestrator.run(mode).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    std::process::exit(outcome.status.exit_code());
}
