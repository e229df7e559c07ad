use anyhow::Result;
use clap::Parser;

use promptwatch_core::PromptwatchConfig;
use promptwatch_daemon::cli::DaemonCli;
use promptwatch_daemon::logging;
use promptwatch_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = PromptwatchConfig::load(&cli.config).await.map_err(|e| {
        anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e)
    })?;
    cli.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "promptwatch-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config).await?;
    orchestrator.run().await?;

    tracing::info!("promptwatch-daemon shut down");
    Ok(())
}
