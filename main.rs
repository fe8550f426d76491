// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

use clap::Parser;
use vigil_engine::{run_cli, Cli};

/// Main entry point for the Vigil engine
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_cli(Cli::parse()).await
}
