#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use almond_cloud::config::{EngineConfig, LaunchConfig};
use almond_cloud::engine::{ChatDispatcher, EngineHandle, Isolation};
use almond_cloud::model::TenantRecord;
use almond_cloud::util::lock_unpoisoned;

pub const MOCK_ENGINE: &str = env!("CARGO_BIN_EXE_mock-engine");

/// Configuration launching the mock engine from `root`.
pub fn mock_config(root: &Path, pool_size: usize, extra_args: &[&str]) -> EngineConfig {
    EngineConfig {
        root: root.to_path_buf(),
        enable_shared_process: pool_size > 0,
        shared_pool_size: pool_size,
        isolation: Isolation::None,
        launch: LaunchConfig {
            exec_path: MOCK_ENGINE.into(),
            exec_args: extra_args.iter().map(|a| a.to_string()).collect(),
            engine_path: None,
        },
        handshake_timeout: Duration::from_secs(10),
        shared_restart_delay: Duration::from_millis(50),
        user_restart_delay: Duration::from_millis(200),
        conversation_delay: Duration::from_millis(10),
        picture_poll_interval: Duration::from_millis(20),
        picture_poll_attempts: 5,
        origin: "https://almond.test".into(),
    }
}

pub fn user(id: i64, account: Option<&str>, developer_key: Option<&str>) -> TenantRecord {
    let mut record = TenantRecord::new(id);
    record.external_account_id = account.map(str::to_string);
    record.developer_key = developer_key.map(str::to_string);
    record
}

/// Polls `check` until it holds or ten seconds pass.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Chat side that only records what the supervisor told it.
#[derive(Default)]
pub struct RecordingChat {
    log: Mutex<Vec<String>>,
}

impl RecordingChat {
    pub fn log(&self) -> Vec<String> {
        lock_unpoisoned(&self.log).clone()
    }

    pub fn saw(&self, entry: &str) -> bool {
        lock_unpoisoned(&self.log).iter().any(|e| e == entry)
    }
}

impl ChatDispatcher for RecordingChat {
    fn add_engine(&self, account: &str, _: EngineHandle) {
        lock_unpoisoned(&self.log).push(format!("add {account}"));
    }

    fn remove_engine(&self, account: &str) {
        lock_unpoisoned(&self.log).push(format!("remove {account}"));
    }

    fn remove_all_engines(&self) {
        lock_unpoisoned(&self.log).push("remove all".into());
    }

    fn delete_user(&self, account: &str) {
        lock_unpoisoned(&self.log).push(format!("delete {account}"));
    }
}

pub fn as_chat(chat: &Arc<RecordingChat>) -> Arc<dyn ChatDispatcher> {
    chat.clone()
}
