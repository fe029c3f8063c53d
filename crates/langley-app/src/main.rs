use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "langley", about = "Local HTTPS interception proxy for LLM traffic")]
struct Cli {
	/// Config directory (defaults to the OS config dir, e.g. ~/.config/langley)
	#[arg(long)]
	config_dir: Option<PathBuf>,

	/// Log filter, e.g. "info" or "langley=debug"
	#[arg(long, default_value = "info")]
	log: String,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log.clone())),
		)
		.with_target(false)
		.init();

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::info!("interrupt received");
			let _ = shutdown_tx.send(true);
		}
	});

	match langley::run(cli.config_dir, shutdown_rx).await {
		Ok(()) => std::process::exit(0),
		Err(e) => {
			let a = e.actionable();
			eprintln!("error: {}", a.what);
			eprintln!("cause: {}", a.cause);
			eprintln!("fix:   {}", a.fix);
			std::process::exit(e.exit_code());
		},
	}
}
