//! SID daemon binary.
//!
//! The same executable serves two roles: the bridge process listening
//! for clients, and — when re-executed by worker control with the spawn
//! environment set — a worker process running the scan pipeline.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sid_ubridge::scan::SysPaths;
use sid_ubridge::service::UbridgeConfig;
use sid_ubridge::worker_entry::WorkerConfig;
use sid_ubridge::Registries;
use sid_worker::TimeoutSpec;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "sid")]
#[command(about = "Storage Instantiation Daemon")]
struct Args {
	/// Socket path for the client interface
	#[arg(short, long, value_name = "PATH")]
	socket: Option<PathBuf>,

	/// Path of the on-disk store snapshot
	#[arg(short, long, value_name = "PATH")]
	db: Option<PathBuf>,

	/// Worker execution timeout in milliseconds
	#[arg(short = 't', long, value_name = "MS")]
	worker_timeout: Option<u64>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

fn init_tracing(verbose: bool) {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
				tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
			}),
		)
		.init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	// a worker process finds its channels in the spawn environment
	if let Some(env) = sid_worker::worker_env()? {
		init_tracing(false);
		let config = WorkerConfig {
			registries: Registries::new(),
			paths: SysPaths::default(),
			db_path: sid_proto::paths::db_path(),
		};
		sid_ubridge::worker_entry::run(env, config).await?;
		return Ok(());
	}

	let args = Args::parse();
	init_tracing(args.verbose);

	info!("starting sid");

	let config = UbridgeConfig {
		socket_path: args.socket.unwrap_or_else(sid_proto::paths::socket_path),
		db_path: args.db.unwrap_or_else(sid_proto::paths::db_path),
		worker_timeout: args.worker_timeout.map(|ms| TimeoutSpec {
			duration: Duration::from_millis(ms),
			signal: Some(sid_worker::Signal::SIGTERM),
		}),
	};

	let shutdown = CancellationToken::new();
	sid_ubridge::service::run(config, shutdown).await?;

	Ok(())
}
