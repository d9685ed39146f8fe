use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use voxlink::{Config, Daemon};

/// Voxlink - talk to a conversational agent through your microphone
#[derive(Parser)]
#[command(name = "voxlink", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/voxlink/config.toml)
    #[arg(short, long, env = "VOXLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Input device name (defaults to the system input)
    #[arg(long, env = "VOXLINK_INPUT_DEVICE")]
    input_device: Option<String>,

    /// Output device name (defaults to the system output)
    #[arg(long, env = "VOXLINK_OUTPUT_DEVICE")]
    output_device: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before clap reads env fallbacks
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,voxlink=info",
        1 => "info,voxlink=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(device) = cli.input_device {
        config.audio.input_device = Some(device);
    }
    if let Some(device) = cli.output_device {
        config.audio.output_device = Some(device);
    }

    tracing::info!(
        agent_id = %config.session.agent_id,
        endpoint = %config.session.endpoint,
        input = config.audio.input_device.as_deref().unwrap_or("default"),
        output = config.audio.output_device.as_deref().unwrap_or("default"),
        "starting voxlink"
    );

    Daemon::new(config).run().await?;

    Ok(())
}
