use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod run;

use config::ConfigArgs;
use run::RunArgs;

use almond_cloud::config::EnvConfigSource;

#[derive(Parser, Debug)]
#[command(
    name = "almond-cloud",
    about = "Runs one assistant engine per user and connects them to chat",
    version = "0.2.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine supervisor and the chat dispatcher
    Run(RunArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_source: EnvConfigSource,
}

impl CliContext {
    pub fn new(root: PathBuf, config_source: EnvConfigSource) -> Self {
        Self { root, config_source }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
