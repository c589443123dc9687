use clap::Parser;
use rendergun::{load_config, setup_logging, Cli, CliRunner};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;
    info!("Starting rendergun v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let runner = CliRunner::new(config);

    if let Err(e) = runner.run(args.command).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("Rendergun stopped");
    Ok(())
}
