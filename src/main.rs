//! # Backfill Orchestrator Main Entry Point
//!
//! Dispatches to the API server, administrative commands or the worker.

#[tokio::main]
async fn main() {
    let code = backfill_orchestrator::cli::run().await;
    std::process::exit(code);
}
