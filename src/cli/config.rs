use clap::{Args, Subcommand};

use almond_cloud::config::{ConfigSource, EngineConfig};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Parse the configuration and report the first invalid value
    Check,
    /// Print the engine configuration after defaults are applied
    Show,
    /// Print the raw THINGENGINE_* variables
    Env,
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Check => {
            match EngineConfig::from_source(&context.config_source) {
                Ok(_) => println!("✅ Configuration is valid."),
                Err(err) => {
                    eprintln!("❌ {err}");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        ConfigCommands::Show => {
            let config = EngineConfig::from_source(&context.config_source)?;
            println!("{config:#?}");
            Ok(())
        }
        ConfigCommands::Env => {
            let mut vars: Vec<(String, String)> = context
                .config_source
                .as_vec()
                .into_iter()
                .filter(|(k, _)| k.starts_with("THINGENGINE_"))
                .collect();
            vars.sort();
            for (key, value) in vars {
                println!("{key}={value}");
            }
            Ok(())
        }
    }
}
