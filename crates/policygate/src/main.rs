//! Policy engine sidecar entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use policygate::app;
use policygate::control::config;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Path to the gateway configuration file (YAML). Environment variables
	/// always take precedence over values found here.
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
	policygate_core::telemetry::init();

	let args = Args::parse();
	let config = config::load(args.config)?;

	tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(config))
}

async fn run(config: config::Config) -> anyhow::Result<()> {
	info!(gateway_id = %config.gateway_id, "starting policygate");
	app::run(Arc::new(config)).await?.wait_termination().await
}
