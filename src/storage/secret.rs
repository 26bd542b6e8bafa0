use crate::error::{AppError, AppResult};
use crate::storage::LocalStorage;
use crate::storage::file::{
    set_secure_dir_permissions, set_secure_file_permissions, write_file_atomically,
};
use age::decrypt;
use age::encrypt;
use age::scrypt::Identity as ScryptIdentity;
use age::scrypt::Recipient as ScryptRecipient;
use age::secrecy::ExposeSecret;
use age::secrecy::SecretString;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{Ordering, compiler_fence};
use std::sync::{Mutex, PoisonError};

const KEYRING_SERVICE: &str = "apiblock-cli";
const SECRETS_DIR: &str = "secrets";
const SECRETS_FILE: &str = "session.age";
const SECRETS_VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub struct SecretStoreInfo {
    pub service: String,
    pub account: String,
    pub file_path: PathBuf,
}

/// Key/value store encrypted with age; the passphrase lives in the OS keyring.
#[derive(Debug)]
pub struct SecretStorage {
    config_dir: PathBuf,
    cache: Mutex<Option<BTreeMap<String, String>>>,
}

/// Plaintext layout of `secrets/session.age`: every session slice keyed by its storage key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionSnapshot {
    version: u8,
    items: BTreeMap<String, String>,
}

impl SecretStorage {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            cache: Mutex::new(None),
        }
    }

    pub fn info(&self) -> SecretStoreInfo {
        SecretStoreInfo {
            service: KEYRING_SERVICE.to_string(),
            account: self.keyring_account(),
            file_path: self.secrets_path(),
        }
    }

    /// Decrypts every stored session slice. No file yet means an empty session.
    fn read_snapshot(&self) -> AppResult<BTreeMap<String, String>> {
        let path = self.secrets_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let sealed = fs::read(&path).map_err(|err| {
            AppError::storage(format!("Cannot read session store {}: {err}", path.display()))
        })?;
        let plaintext = open_sealed(&sealed, &self.passphrase()?)?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&plaintext).map_err(|err| {
            AppError::storage(format!("Session store {} is corrupt: {err}", path.display()))
        })?;

        if snapshot.version > SECRETS_VERSION {
            return Err(AppError::storage(format!(
                "Session store {} uses format {}; this build reads up to {SECRETS_VERSION}.",
                path.display(),
                snapshot.version
            )));
        }
        Ok(snapshot.items)
    }

    /// Re-encrypts the whole slice map; called after every changed key.
    fn write_snapshot(&self, items: &BTreeMap<String, String>) -> AppResult<()> {
        self.ensure_secrets_dir()?;

        let snapshot = SessionSnapshot {
            version: SECRETS_VERSION,
            items: items.clone(),
        };
        let plaintext = serde_json::to_vec(&snapshot).map_err(|err| {
            AppError::storage(format!("Cannot encode session slices: {err}"))
        })?;
        let sealed = seal(&plaintext, &self.passphrase()?)?;

        let path = self.secrets_path();
        write_file_atomically(&path, &sealed)?;
        set_secure_file_permissions(&path)
    }

    /// Runs `action` on the cached slice map, decrypting it on first access.
    fn with_items<T, F>(&self, action: F) -> AppResult<T>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> AppResult<T>,
    {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.is_none() {
            *cache = Some(self.read_snapshot()?);
        }
        match cache.as_mut() {
            Some(items) => action(items),
            None => Err(AppError::storage("Secret cache was not initialised.")),
        }
    }

    /// Passphrase of the session store, created and saved to the keyring on first use.
    fn passphrase(&self) -> AppResult<SecretString> {
        let account = self.keyring_account();
        let keyring_error = |action: &str, err: keyring::Error| {
            AppError::storage(format!(
                "Cannot {action} session passphrase in keyring `{KEYRING_SERVICE}` ({account}): {err}"
            ))
        };
        let entry = Entry::new(KEYRING_SERVICE, &account)
            .map_err(|err| keyring_error("open", err))?;

        match entry.get_password() {
            Ok(stored) => Ok(SecretString::from(stored)),
            Err(keyring::Error::NoEntry) => {
                let fresh = random_passphrase();
                log::debug!("created session passphrase for keyring account {account}");
                entry
                    .set_password(fresh.expose_secret())
                    .map_err(|err| keyring_error("store", err))?;
                Ok(fresh)
            }
            Err(err) => Err(keyring_error("read", err)),
        }
    }

    fn ensure_secrets_dir(&self) -> AppResult<()> {
        let dir = self.secrets_dir();
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::storage(format!(
                "Failed to create secret directory {}: {err}",
                dir.display()
            ))
        })?;
        set_secure_dir_permissions(&dir)
    }

    fn secrets_dir(&self) -> PathBuf {
        self.config_dir.join(SECRETS_DIR)
    }

    fn secrets_path(&self) -> PathBuf {
        self.secrets_dir().join(SECRETS_FILE)
    }

    /// One keyring account per config directory, so separate `--config` roots
    /// keep separate session passphrases.
    fn keyring_account(&self) -> String {
        let canonical = self
            .config_dir
            .canonicalize()
            .unwrap_or_else(|_| self.config_dir.clone())
            .to_string_lossy()
            .into_owned();

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let hex = format!("{digest:x}");
        let short = hex.get(..16).unwrap_or(hex.as_str());
        format!("session|{short}")
    }
}

impl LocalStorage for SecretStorage {
    fn get_item(&self, key: &str) -> AppResult<Option<String>> {
        self.with_items(|items| Ok(items.get(key).cloned()))
    }

    fn set_item(&self, key: &str, value: &str) -> AppResult<()> {
        self.with_items(|items| {
            if items.get(key).map(String::as_str) == Some(value) {
                return Ok(());
            }
            items.insert(key.to_string(), value.to_string());
            self.write_snapshot(items)
        })
    }

    fn remove_item(&self, key: &str) -> AppResult<()> {
        self.with_items(|items| {
            if items.remove(key).is_none() {
                return Ok(());
            }
            self.write_snapshot(items)
        })
    }
}

fn seal(plaintext: &[u8], passphrase: &SecretString) -> AppResult<Vec<u8>> {
    encrypt(&ScryptRecipient::new(passphrase.clone()), plaintext)
        .map_err(|err| AppError::storage(format!("Cannot encrypt session store: {err}")))
}

fn open_sealed(sealed: &[u8], passphrase: &SecretString) -> AppResult<Vec<u8>> {
    decrypt(&ScryptIdentity::new(passphrase.clone()), sealed).map_err(|err| {
        AppError::storage(format!(
            "Cannot decrypt session store (keyring passphrase changed?): {err}"
        ))
    })
}

/// 32 random bytes, base64 encoded; the raw bytes are zeroed afterwards.
fn random_passphrase() -> SecretString {
    let mut seed: [u8; 32] = rand::random();
    let encoded = BASE64_STANDARD.encode(seed);
    wipe_bytes(&mut seed);
    SecretString::from(encoded)
}

fn wipe_bytes(bytes: &mut [u8]) {
    for byte in bytes {
        // SAFETY: byte is a valid mutable reference into bytes.
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_snapshot_opens_only_with_its_passphrase() {
        let passphrase = random_passphrase();
        let sealed = seal(b"{\"version\":1,\"items\":{}}", &passphrase).unwrap();

        let opened = open_sealed(&sealed, &passphrase).unwrap();
        assert_eq!(opened, b"{\"version\":1,\"items\":{}}");

        let err = open_sealed(&sealed, &random_passphrase()).unwrap_err();
        assert!(err.message.starts_with("Cannot decrypt session store"));
    }

    #[test]
    fn keyring_account_is_stable_per_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let first = SecretStorage::new(dir.path().to_path_buf());
        let second = SecretStorage::new(dir.path().to_path_buf());
        let other = SecretStorage::new(dir.path().join("nested"));

        assert_eq!(first.keyring_account(), second.keyring_account());
        assert_ne!(first.keyring_account(), other.keyring_account());
        assert!(first.keyring_account().starts_with("session|"));
    }
}
