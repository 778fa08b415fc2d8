use std::{env, path::PathBuf};

use clap::Parser;

mod cli;

use almond_cloud::config::{EnvConfigSource, ROOT};
use cli::{Cli, CliContext};

/// Resolve the engine root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var(ROOT) {
        PathBuf::from(path)
    } else {
        PathBuf::from("./almond")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let config_source = EnvConfigSource::new(Some(root.join("config").join(".env")));
    let context = CliContext::new(root, config_source);
    cli::execute(&context, cli.command.unwrap_or_else(cli::default_command)).await
}
