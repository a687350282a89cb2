use clap::Parser;
use my2redis_lib::{setup_shutdown_handler, Config, River};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// MySQL to Redis replication daemon
#[derive(Debug, Parser)]
#[command(name = "my2redis", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args = Args::parse();
    tracing::info!("starting my2redis with config {}", args.config.display());

    let config = match Config::from_file(&args.config).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("failed to load config: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut river = match River::new(config) {
        Ok(river) => river,
        Err(err) => {
            tracing::error!("bootstrap failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn(setup_shutdown_handler(river.cancellation_token()));

    match river.run().await {
        Ok(()) => {
            tracing::info!("my2redis stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("replication failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging
///
/// The log level is controlled via the `RUST_LOG` environment variable.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("my2redis=debug,my2redis_lib=debug,mysql_async=info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
