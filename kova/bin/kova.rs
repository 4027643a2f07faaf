//! Dispatch generated report mail over SMTP.

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kova::{Settings, commands};

#[derive(Parser, Debug)]
#[command(name = "kova")]
#[command(about = "Send report mail in group, input and bulk phases", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send every job in a manifest and print the dispatch report
    Dispatch {
        /// JSON job manifest
        #[arg(short, long)]
        manifest: PathBuf,

        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and try to log in to the relay
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    kova_common::logging::init();

    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .bootstrap()
        .context("Failed to create data directories")?;

    let ok = match cli.command {
        Command::Dispatch { manifest, json } => {
            commands::dispatch(&settings, &manifest, json).await?
        }
        Command::Check => commands::check(&settings).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
