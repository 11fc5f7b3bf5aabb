use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cinch_core::config::CinchConfig;

use crate::runtime::Cinch;

/// Cinch — distributed CI on hardware you own.
#[derive(Parser)]
#[command(name = "cinch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane.
    Serve(ServeCommand),

    /// Apply pending database migrations and exit.
    Migrate(MigrateCommand),
}

#[derive(Parser)]
pub struct ServeCommand {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "cinch.toml")]
    pub config: PathBuf,
}

#[derive(Parser)]
pub struct MigrateCommand {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "cinch.toml")]
    pub config: PathBuf,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        init_tracing();

        match self.command {
            Commands::Serve(cmd) => {
                let config = load_config(&cmd.config)?;
                Cinch::new(config).run().await?;
            }
            Commands::Migrate(cmd) => {
                let config = load_config(&cmd.config)?;
                Cinch::new(config).migrate().await?;
                tracing::info!("Migrations applied");
            }
        }

        Ok(())
    }
}

fn load_config(path: &PathBuf) -> Result<CinchConfig> {
    CinchConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
