use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use almond_cloud::apps::App;
use almond_cloud::assistant::InMemoryMessaging;
use almond_cloud::config::EngineConfig;
use almond_cloud::logger::{init_tracing, normalize_level};
use almond_cloud::model::{InMemoryUserStore, UserStore};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write the log file as newline-delimited JSON
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,

    /// JSON file with the user records to serve
    #[arg(long)]
    pub users: Option<PathBuf>,

    /// Our own account on the messaging service
    #[arg(long, default_value = "almond")]
    pub account: String,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self { log_level: "info".to_string(), json_logs: false, users: None, account: "almond".to_string() }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_source(&context.config_source).context("invalid configuration")?;
    config.root = context.root.clone();

    let log_file = "logs/almond-cloud.log".to_string();
    init_tracing(config.root.clone(), log_file, normalize_level(&args.log_level).to_string(), args.json_logs)?;
    info!("Almond cloud starting up…");

    let store: Arc<dyn UserStore> = match &args.users {
        Some(path) => {
            if !path.exists() {
                let err = format!("User file `{}` does not exist.", path.display());
                error!("{}", err);
                bail!(err);
            }
            let store = InMemoryUserStore::from_file(path)
                .with_context(|| format!("Failed to load users from {}", path.display()))?;
            info!(users = store.len(), "loaded users");
            Arc::new(store)
        }
        None => Arc::new(InMemoryUserStore::new()),
    };
    let messaging = Arc::new(InMemoryMessaging::new(&args.account));

    let mut app = App::new();
    if let Err(err) = app.bootstrap(config, store, messaging).await {
        error!("Failed to bootstrap almond cloud: {:#}", err);
        app.shutdown().await;
        std::process::exit(1);
    }

    info!("Almond cloud running; press Ctrl-C to exit");
    println!("Almond cloud running; press Ctrl-C to exit");

    signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("Almond cloud shutting down");

    app.shutdown().await;

    println!("Goodbye!");
    Ok(())
}
