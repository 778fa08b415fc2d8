//! Account creation for chat contacts that have no user yet.

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{EngineDirectory, EngineError};
use crate::model::{NewTenant, StoreError, TenantRecord, UserStore};

const MAX_FIELD_LEN: usize = 255;
const SECRET_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("You must specify a valid username")]
    InvalidUsername,
    #[error("You must specify a valid email")]
    InvalidEmail,
    #[error("Invalid password")]
    InvalidPassword,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn text_field<'a>(msg: &'a Value, key: &str) -> Option<&'a str> {
    msg.get(key).and_then(Value::as_str)
}

/// Checks a `complete-registration` payload sent by `account`.
pub fn validate(msg: &Value, account: &str) -> Result<NewTenant, RegistrationError> {
    let username = text_field(msg, "username")
        .filter(|u| !u.is_empty() && u.chars().count() <= MAX_FIELD_LEN)
        .ok_or(RegistrationError::InvalidUsername)?;
    let email = text_field(msg, "email")
        .filter(|e| !e.is_empty() && e.contains('@') && e.chars().count() <= MAX_FIELD_LEN)
        .ok_or(RegistrationError::InvalidEmail)?;
    let password_hash = text_field(msg, "password-hash")
        .filter(|h| h.chars().count() == SECRET_LEN)
        .ok_or(RegistrationError::InvalidPassword)?;
    let salt = text_field(msg, "salt")
        .filter(|s| s.chars().count() == SECRET_LEN)
        .ok_or(RegistrationError::InvalidPassword)?;

    Ok(NewTenant {
        username: username.to_string(),
        email: email.to_string(),
        password_hash: password_hash.to_string(),
        salt: salt.to_string(),
        external_account_id: Some(account.to_string()),
    })
}

/// Validates the payload, creates the user and starts their engine.
pub async fn register(
    msg: &Value,
    account: &str,
    store: &dyn UserStore,
    engines: &dyn EngineDirectory,
) -> Result<TenantRecord, RegistrationError> {
    let new = validate(msg, account)?;
    let user = store.create(new).await?;
    info!(user_id = user.id, account, "registered user from chat");
    if let Err(err) = engines.start_user(user.id).await {
        // the user only exists once their engine is up
        if let Err(undo) = store.delete(user.id).await {
            warn!(user_id = user.id, error = %undo, "failed to roll back registration");
        }
        return Err(err.into());
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::engine::EngineHandle;
    use crate::model::InMemoryUserStore;

    fn payload() -> Value {
        json!({
            "op": "complete-registration",
            "username": "alice",
            "email": "alice@example.com",
            "password-hash": "a".repeat(64),
            "salt": "b".repeat(64),
        })
    }

    #[test]
    fn valid_payloads_carry_the_account() {
        let new = validate(&payload(), "acct-1").unwrap();
        assert_eq!(new.username, "alice");
        assert_eq!(new.external_account_id.as_deref(), Some("acct-1"));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let mut missing_email = payload();
        missing_email.as_object_mut().unwrap().remove("email");
        assert!(matches!(validate(&missing_email, "a"), Err(RegistrationError::InvalidEmail)));

        let mut no_at = payload();
        no_at["email"] = json!("alice.example.com");
        assert!(matches!(validate(&no_at, "a"), Err(RegistrationError::InvalidEmail)));

        let mut long_name = payload();
        long_name["username"] = json!("x".repeat(256));
        assert!(matches!(validate(&long_name, "a"), Err(RegistrationError::InvalidUsername)));

        let mut short_hash = payload();
        short_hash["password-hash"] = json!("a".repeat(63));
        assert!(matches!(validate(&short_hash, "a"), Err(RegistrationError::InvalidPassword)));

        let mut numeric_salt = payload();
        numeric_salt["salt"] = json!(5);
        let err = validate(&numeric_salt, "a").unwrap_err();
        assert_eq!(err.to_string(), "Invalid password");
    }

    #[derive(Default)]
    struct CountingEngines {
        started: AtomicUsize,
        failing: bool,
    }

    #[async_trait]
    impl EngineDirectory for CountingEngines {
        fn get_engine(&self, user_id: i64) -> Result<EngineHandle, EngineError> {
            Err(EngineError::NotRunning(user_id))
        }

        async fn start_user(&self, user_id: i64) -> Result<(), EngineError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(EngineError::NotRunning(user_id));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejected_payloads_create_nothing() {
        let store = InMemoryUserStore::new();
        let engines = CountingEngines::default();
        let mut bad = payload();
        bad["email"] = json!("nobody");

        assert!(register(&bad, "acct", &store, &engines).await.is_err());
        assert!(store.is_empty());
        assert_eq!(engines.started.load(Ordering::SeqCst), 0);

        let user = register(&payload(), "acct", &store, &engines).await.unwrap();
        assert_eq!(user.external_account_id.as_deref(), Some("acct"));
        assert_eq!(store.len(), 1);
        assert_eq!(engines.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_engine_start_undoes_the_user() {
        let store = InMemoryUserStore::new();
        let engines = CountingEngines { failing: true, ..Default::default() };

        let err = register(&payload(), "acct", &store, &engines).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Engine(_)), "{err}");
        assert!(store.is_empty());

        // the same username can be tried again
        let err = register(&payload(), "acct", &store, &engines).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Engine(_)), "{err}");
        assert!(store.is_empty());
        assert_eq!(engines.started.load(Ordering::SeqCst), 2);
    }
}
