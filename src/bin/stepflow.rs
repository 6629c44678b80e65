/// Stepflow CLI
///
/// Administrative commands for the workflow step interpreter: validate and
/// diagram workflow definitions, and start, inspect, resume or cancel runs
/// against the configured database.
use stepflow_core::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
