//! String-keyed persistence for session slices.
//!
//! Values are JSON-encoded strings. Readers treat missing or corrupt entries as
//! defaults; only I/O on the backing store itself surfaces as an error.

pub mod file;
pub mod memory;
pub mod secret;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use secret::SecretStorage;

use crate::error::{AppError, AppResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::env;
use std::fs;
use std::path::PathBuf;

pub const SERVICE_CODE_KEY: &str = "servicecode";
pub const AUTH_VALUES_KEY: &str = "apiblock.authValues";
pub const IS_AUTHENTICATED_KEY: &str = "apiblock.isAuthenticated";
pub const INPUT_VALUES_KEY: &str = "apiblock.inputValues";
pub const EDITING_ID_KEY: &str = "apiblock.editingId";
pub const OAUTH_STATE_KEY: &str = "apiblock.oauthState";

/// Slices that belong to one service session and are dropped when it ends.
pub const SESSION_KEYS: [&str; 5] = [
    AUTH_VALUES_KEY,
    IS_AUTHENTICATED_KEY,
    INPUT_VALUES_KEY,
    EDITING_ID_KEY,
    OAUTH_STATE_KEY,
];

const APP_CONFIG_DIR_ENV: &str = "APIBLOCK_CONFIG_DIR";
const APP_NAME: &str = "apiblock-cli";

pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> AppResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove_item(&self, key: &str) -> AppResult<()>;
}

pub fn read_slice<T>(storage: &dyn LocalStorage, key: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let raw = match storage.get_item(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return T::default(),
        Err(err) => {
            log::warn!("could not read `{key}` from storage, using default: {err}");
            return T::default();
        }
    };

    serde_json::from_str(&raw).unwrap_or_else(|err| {
        log::warn!("stored `{key}` is not valid JSON, using default: {err}");
        T::default()
    })
}

pub fn write_slice<T>(storage: &dyn LocalStorage, key: &str, value: &T) -> AppResult<()>
where
    T: Serialize + ?Sized,
{
    let encoded = serde_json::to_string(value)
        .map_err(|err| AppError::storage(format!("Failed to encode `{key}`: {err}")))?;
    storage.set_item(key, &encoded)
}

pub fn clear_session_slices(storage: &dyn LocalStorage) -> AppResult<()> {
    for key in SESSION_KEYS {
        storage.remove_item(key)?;
    }
    Ok(())
}

pub fn config_dir() -> AppResult<PathBuf> {
    if let Ok(path) = env::var(APP_CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(path));
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = env::var("APPDATA") {
            return Ok(PathBuf::from(path).join(APP_NAME));
        }
        if let Ok(path) = env::var("LOCALAPPDATA") {
            return Ok(PathBuf::from(path).join(APP_NAME));
        }
    }

    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(path).join(APP_NAME));
    }

    if let Ok(path) = env::var("HOME") {
        return Ok(PathBuf::from(path).join(".config").join(APP_NAME));
    }

    Err(AppError::storage(
        "Could not determine config directory. Set HOME, XDG_CONFIG_HOME, or APIBLOCK_CONFIG_DIR.",
    ))
}

pub fn ensure_config_dir() -> AppResult<PathBuf> {
    let dir = config_dir()?;
    fs::create_dir_all(&dir).map_err(|err| {
        AppError::storage(format!(
            "Failed to create config directory {}: {err}",
            dir.display()
        ))
    })?;
    Ok(dir)
}
