mod handoff;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use streamcast_core::{load_config, logging, Error};

use server::StreamcastServer;

#[derive(Parser, Debug)]
#[command(name = "streamcast")]
#[command(about = "Live audio server with time-shifted playback", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML). Searched for when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration (fail fast listing every problem)
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(Error::Validation(errors)) => {
            for e in &errors {
                eprintln!("Config validation error: {e}");
            }
            anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
        }
        Err(e) => return Err(e.into()),
    };

    if args.check {
        println!("Configuration OK: {} stream(s)", config.streams.len());
        return Ok(());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Streamcast starting...");
    if let Some(source) = &config.handoff.source {
        info!("Handoff source: {}", source);
    }
    if let Some(listen) = &config.handoff.listen {
        info!("Handoff address: {}", listen);
    }

    // 3. Build streams and run until shutdown
    let server = StreamcastServer::new(config);
    server.start().await
}
