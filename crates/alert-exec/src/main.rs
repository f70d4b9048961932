use clap::Parser;
use tracing::{error, info};

use alert_exec::{
    config::{CliArgs, Config},
    logging,
    metrics::Metrics,
    server::Server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load configuration: defaults < file < environment < flags
    let config = Config::load(cli.config.as_deref()).and_then(|mut config| {
        config.apply_overrides(&cli)?;
        config.validate()?;
        Ok(config)
    });

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            // Nothing configured a level yet; report at the default one
            logging::init("info")?;
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Initialize logging
    logging::init(&config.log_level)?;

    info!(
        listen = %config.listen,
        command = %config.command,
        timeout = ?config.timeout,
        has_token = config.has_token(),
        "starting alert-exec"
    );

    let metrics = Metrics::new()?;
    let server = Server::new(config, metrics);

    if let Err(e) = server.start().await {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }

    Ok(())
}
