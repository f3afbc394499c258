use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Parse CLI arguments first to get verbosity level
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = cli::commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch(args) => {
            info!("Watch command: {:?}", args);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cli::commands::watch::execute(args, config))?;
        }
        Commands::Backends => {
            cli::commands::inspect::list_backends(config)?;
        }
        Commands::Stat(args) => {
            cli::commands::inspect::stat(&args.path)?;
        }
        Commands::Config(args) => {
            cli::commands::config::execute(args, &config)?;
        }
    }

    Ok(())
}
