use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Installs the global tracing subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or
///   `"almond_cloud=debug,engine_rpc=info"`); `RUST_LOG` wins when set.
/// - `log_file` is relative to `root` and rotated daily.
/// - with `json` the file layer writes newline-delimited JSON.
pub fn init_tracing(root: PathBuf, log_file: String, log_level: String, json: bool) -> Result<()> {
    let path = root.join(&log_file);
    let dir = path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| root.clone());
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("log file `{}` has no file name", log_file))?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("could not create log directory {}", dir.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    let appender = RollingFileAppender::new(Rotation::DAILY, &dir, file_name);

    let stdout_layer = fmt::layer().with_target(false);
    let (text_layer, json_layer) = if json {
        (None, Some(fmt::layer().json().with_writer(appender).with_target(true)))
    } else {
        (Some(fmt::layer().with_writer(appender).with_ansi(false)), None)
    };

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .map_err(|err| anyhow!("could not install tracing subscriber: {err}"))?;

    Ok(())
}

/// Maps a textual level the way the CLI accepts it; unknown values fall back
/// to `info`.
pub fn normalize_level(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        other => {
            warn!("unknown log level `{other}`, using info");
            "info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_normalized() {
        assert_eq!(normalize_level("WARNING"), "warn");
        assert_eq!(normalize_level("critical"), "error");
        assert_eq!(normalize_level("loud"), "info");
    }

    #[test]
    fn log_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        // a second install in the same test binary fails, but the directory
        // is created before the subscriber is installed
        let _ = init_tracing(dir.path().to_path_buf(), "logs/almond.log".into(), "info".into(), false);
        assert!(dir.path().join("logs").is_dir());
    }
}
