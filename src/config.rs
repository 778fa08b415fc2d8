use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::Isolation;

/// A flat key/value view over wherever configuration comes from.
pub trait ConfigSource: Send + Sync {
    fn keys(&self) -> Vec<String>;
    fn get(&self, key: &str) -> Option<String>;

    fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys() {
            if let Some(value) = self.get(&key) {
                config.push((key, value));
            }
        }
        config
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigSource {
    env_file: Option<PathBuf>,
}

impl EnvConfigSource {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        if let Some(path) = &env_file {
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => info!("Loaded .env from {}", path.display()),
                    Err(err) => warn!("could not parse .env at {}: {}", path.display(), err),
                }
            } else {
                info!("no .env at {}, using the process environment", path.display());
            }
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> Option<&PathBuf> {
        self.env_file.as_ref()
    }
}

impl ConfigSource for EnvConfigSource {
    fn keys(&self) -> Vec<String> {
        env::vars_os().filter_map(|(k, _)| k.into_string().ok()).collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    map: DashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

impl ConfigSource for MapConfigSource {
    fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid { key: String, value: String, reason: String },
}

pub const ROOT: &str = "THINGENGINE_ROOT";
pub const ENABLE_SHARED_PROCESS: &str = "THINGENGINE_ENABLE_SHARED_PROCESS";
pub const SHARED_PROCESS_FACTOR: &str = "THINGENGINE_SHARED_PROCESS_FACTOR";
pub const SHARED_POOL_SIZE: &str = "THINGENGINE_SHARED_POOL_SIZE";
pub const DISABLE_SANDBOX: &str = "THINGENGINE_DISABLE_SANDBOX";
pub const SANDBOX_PATH: &str = "THINGENGINE_SANDBOX_PATH";
pub const EXEC_PATH: &str = "THINGENGINE_EXEC_PATH";
pub const EXEC_ARGS: &str = "THINGENGINE_EXEC_ARGS";
pub const ENGINE_PATH: &str = "THINGENGINE_ENGINE_PATH";
pub const HANDSHAKE_TIMEOUT_MS: &str = "THINGENGINE_HANDSHAKE_TIMEOUT_MS";
pub const SHARED_RESTART_DELAY_MS: &str = "THINGENGINE_SHARED_RESTART_DELAY_MS";
pub const USER_RESTART_DELAY_MS: &str = "THINGENGINE_USER_RESTART_DELAY_MS";
pub const CONVERSATION_DELAY_MS: &str = "THINGENGINE_CONVERSATION_DELAY_MS";
pub const PICTURE_POLL_INTERVAL_MS: &str = "THINGENGINE_PICTURE_POLL_INTERVAL_MS";
pub const PICTURE_POLL_ATTEMPTS: &str = "THINGENGINE_PICTURE_POLL_ATTEMPTS";
pub const ORIGIN: &str = "THINGENGINE_ORIGIN";

/// How to launch engine processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub exec_path: PathBuf,
    pub exec_args: Vec<String>,
    /// Script or module handed to `exec_path`; omitted when `None`.
    pub engine_path: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            exec_path: PathBuf::from("node"),
            exec_args: vec![],
            engine_path: Some(PathBuf::from("lib/instance/runengine")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub enable_shared_process: bool,
    pub shared_pool_size: usize,
    /// Isolation applied to dedicated processes.
    pub isolation: Isolation,
    pub launch: LaunchConfig,
    pub handshake_timeout: Duration,
    pub shared_restart_delay: Duration,
    pub user_restart_delay: Duration,
    pub conversation_delay: Duration,
    pub picture_poll_interval: Duration,
    pub picture_poll_attempts: u32,
    pub origin: String,
}

fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./almond"),
            enable_shared_process: true,
            shared_pool_size: 2 * cpu_count(),
            isolation: Isolation::Sandboxed { wrapper: PathBuf::from("sandbox/sandbox") },
            launch: LaunchConfig::default(),
            handshake_timeout: Duration::from_millis(30_000),
            shared_restart_delay: Duration::from_millis(5_000),
            user_restart_delay: Duration::from_millis(10_000),
            conversation_delay: Duration::from_millis(500),
            picture_poll_interval: Duration::from_millis(1_000),
            picture_poll_attempts: 10,
            origin: "http://127.0.0.1:8080".to_string(),
        }
    }
}

fn parse<T>(source: &dyn ConfigSource, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match source.get(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}

fn parse_bool(source: &dyn ConfigSource, key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = source.get(key) else { return Ok(None) };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn millis(source: &dyn ConfigSource, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parse::<u64>(source, key)?.map(Duration::from_millis).unwrap_or(default))
}

impl EngineConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let enable_shared_process =
            parse_bool(source, ENABLE_SHARED_PROCESS)?.unwrap_or(defaults.enable_shared_process);
        let factor = parse::<usize>(source, SHARED_PROCESS_FACTOR)?.unwrap_or(2);
        let shared_pool_size = match parse::<usize>(source, SHARED_POOL_SIZE)? {
            Some(n) => n,
            None => factor * cpu_count(),
        };

        let isolation = if parse_bool(source, DISABLE_SANDBOX)?.unwrap_or(false) {
            Isolation::None
        } else {
            let wrapper = source
                .get(SANDBOX_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sandbox/sandbox"));
            Isolation::Sandboxed { wrapper }
        };

        let mut launch = LaunchConfig::default();
        if let Some(exec) = source.get(EXEC_PATH) {
            launch.exec_path = PathBuf::from(exec);
        }
        if let Some(args) = source.get(EXEC_ARGS) {
            launch.exec_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(engine) = source.get(ENGINE_PATH) {
            launch.engine_path = if engine.trim().is_empty() { None } else { Some(PathBuf::from(engine)) };
        }

        Ok(Self {
            root: source.get(ROOT).map(PathBuf::from).unwrap_or(defaults.root),
            enable_shared_process,
            shared_pool_size,
            isolation,
            launch,
            handshake_timeout: millis(source, HANDSHAKE_TIMEOUT_MS, defaults.handshake_timeout)?,
            shared_restart_delay: millis(source, SHARED_RESTART_DELAY_MS, defaults.shared_restart_delay)?,
            user_restart_delay: millis(source, USER_RESTART_DELAY_MS, defaults.user_restart_delay)?,
            conversation_delay: millis(source, CONVERSATION_DELAY_MS, defaults.conversation_delay)?,
            picture_poll_interval: millis(source, PICTURE_POLL_INTERVAL_MS, defaults.picture_poll_interval)?,
            picture_poll_attempts: parse::<u32>(source, PICTURE_POLL_ATTEMPTS)?
                .unwrap_or(defaults.picture_poll_attempts),
            origin: source.get(ORIGIN).unwrap_or(defaults.origin),
        })
    }

    /// Number of shared processes to pre-spawn; zero when shared mode is off.
    pub fn effective_pool_size(&self) -> usize {
        if self.enable_shared_process { self.shared_pool_size } else { 0 }
    }
}
