//! Tenant records and the narrow store interface the supervisor needs.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use engine_rpc::Lock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::util::lock_unpoisoned;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: i64,
    pub cloud_id: String,
    pub auth_token: String,
    /// Linked account on the external messaging service.
    #[serde(default)]
    pub external_account_id: Option<String>,
    #[serde(default)]
    pub developer_key: Option<String>,
    #[serde(default)]
    pub force_separate_process: bool,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing)]
    pub salt: Option<String>,
}

impl TenantRecord {
    /// A fresh record with generated cloud id and auth token.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            cloud_id: Uuid::new_v4().simple().to_string(),
            auth_token: Uuid::new_v4().simple().to_string(),
            external_account_id: None,
            developer_key: None,
            force_separate_process: false,
            locale: None,
            username: None,
            email: None,
            password_hash: None,
            salt: None,
        }
    }
}

/// Fields collected by the registration flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTenant {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub external_account_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} does not exist")]
    NotFound(i64),
    #[error("username `{0}` is already taken")]
    DuplicateUsername(String),
    #[error("user store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("user store data is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<TenantRecord>, StoreError>;
    async fn get(&self, id: i64) -> Result<TenantRecord, StoreError>;
    async fn get_by_account(&self, account: &str) -> Result<Option<TenantRecord>, StoreError>;
    async fn get_by_username(&self, username: &str) -> Result<Option<TenantRecord>, StoreError>;
    /// Creates a user; the username check and the insert are atomic.
    async fn create(&self, new: NewTenant) -> Result<TenantRecord, StoreError>;
    async fn set_external_account(&self, id: i64, account: Option<String>) -> Result<(), StoreError>;
    async fn delete(&self, id: i64) -> Result<(), StoreError>;
}

/// Store backed by a vector, optionally seeded from a JSON file.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: Mutex<Vec<TenantRecord>>,
    // serializes check-then-act sequences such as registration
    write_lock: Lock,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: Vec<TenantRecord>) -> Self {
        Self { users: Mutex::new(users), write_lock: Lock::new() }
    }

    /// Loads a JSON array of tenant records.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let data = std::fs::read_to_string(path)?;
        let users: Vec<TenantRecord> = serde_json::from_str(&data)?;
        Ok(Self::with_users(users))
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.users).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find<P: Fn(&TenantRecord) -> bool>(&self, pred: P) -> Option<TenantRecord> {
        lock_unpoisoned(&self.users).iter().find(|u| pred(u)).cloned()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_all(&self) -> Result<Vec<TenantRecord>, StoreError> {
        Ok(lock_unpoisoned(&self.users).clone())
    }

    async fn get(&self, id: i64) -> Result<TenantRecord, StoreError> {
        self.find(|u| u.id == id).ok_or(StoreError::NotFound(id))
    }

    async fn get_by_account(&self, account: &str) -> Result<Option<TenantRecord>, StoreError> {
        Ok(self.find(|u| u.external_account_id.as_deref() == Some(account)))
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<TenantRecord>, StoreError> {
        Ok(self.find(|u| u.username.as_deref() == Some(username)))
    }

    async fn create(&self, new: NewTenant) -> Result<TenantRecord, StoreError> {
        let guard = self.write_lock.acquire().await;
        if self.get_by_username(&new.username).await?.is_some() {
            guard.release();
            return Err(StoreError::DuplicateUsername(new.username));
        }

        let mut users = lock_unpoisoned(&self.users);
        let id = users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        let mut record = TenantRecord::new(id);
        record.username = Some(new.username);
        record.email = Some(new.email);
        record.password_hash = Some(new.password_hash);
        record.salt = Some(new.salt);
        record.external_account_id = new.external_account_id;
        users.push(record.clone());
        drop(users);

        guard.release();
        Ok(record)
    }

    async fn set_external_account(&self, id: i64, account: Option<String>) -> Result<(), StoreError> {
        let mut users = lock_unpoisoned(&self.users);
        let user = users.iter_mut().find(|u| u.id == id).ok_or(StoreError::NotFound(id))?;
        user.external_account_id = account;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut users = lock_unpoisoned(&self.users);
        let before = users.len();
        users.retain(|u| u.id != id);
        if users.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_tenant(username: &str) -> NewTenant {
        NewTenant {
            username: username.into(),
            email: format!("{username}@example.com"),
            password_hash: "a".repeat(64),
            salt: "b".repeat(64),
            external_account_id: Some(format!("acct-{username}")),
        }
    }

    #[tokio::test]
    async fn create_assigns_ids_and_credentials() {
        let store = InMemoryUserStore::new();
        let a = store.create(new_tenant("alice")).await.unwrap();
        let b = store.create(new_tenant("bob")).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_ne!(a.cloud_id, b.cloud_id);
        assert_eq!(a.cloud_id.len(), 32);
        assert_eq!(store.get_by_account("acct-bob").await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn concurrent_registrations_of_one_username_create_one_user() {
        let store = Arc::new(InMemoryUserStore::new());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create(new_tenant("carol")).await })
            })
            .collect();
        let mut created = 0;
        for t in tasks {
            if t.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn records_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(
            &path,
            r#"[{"id": 7, "cloud_id": "c7", "auth_token": "t7", "developer_key": "k"}]"#,
        )
        .unwrap();
        let store = InMemoryUserStore::from_file(&path).unwrap();
        let u = store.get(7).await.unwrap();
        assert_eq!(u.developer_key.as_deref(), Some("k"));
        assert!(!u.force_separate_process);
        assert!(matches!(store.get(8).await, Err(StoreError::NotFound(8))));
        store.delete(7).await.unwrap();
        assert!(store.is_empty());
    }
}
