use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    fableforge::logging::init().context("init logging")?;

    let cli = fableforge::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        fableforge::cli::Command::Enqueue(args) => {
            fableforge::app::commands::enqueue(args)
                .await
                .context("enqueue")?;
        }
        fableforge::cli::Command::Worker(args) => {
            fableforge::app::commands::worker(args)
                .await
                .context("worker")?;
        }
        fableforge::cli::Command::Status(args) => {
            fableforge::app::commands::status(args)
                .await
                .context("status")?;
        }
    }

    Ok(())
}
