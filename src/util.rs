use std::ffi::OsString;
use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Environment variables an engine process may inherit.
pub const ALLOWED_ENVS: &[&str] = &["LANG", "LOGNAME", "USER", "PATH", "HOME", "SHELL", "THINGENGINE_PROXY"];

pub fn env_is_allowed(name: &str) -> bool {
    name.starts_with("LC_") || ALLOWED_ENVS.contains(&name)
}

/// Filters `vars` down to the allowlist. Names that are not valid unicode
/// are never allowed; values pass through untouched.
pub fn filter_env<I>(vars: I) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter(|(k, _)| k.to_str().is_some_and(env_is_allowed))
        .collect()
}
