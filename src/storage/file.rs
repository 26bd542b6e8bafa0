use crate::error::{AppError, AppResult};
use crate::storage::LocalStorage;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

const STORAGE_FILE: &str = "storage.json";

/// Plain JSON object file holding every key in one document.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStorage {
    pub fn new(config_dir: &Path) -> Self {
        Self::at(config_dir.join(STORAGE_FILE))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    fn read_all(&self) -> AppResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = fs::read_to_string(&self.path).map_err(|err| {
            AppError::storage(format!(
                "Failed to read storage file {}: {err}",
                self.path.display()
            ))
        })?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(err) => {
                log::warn!(
                    "storage file {} is corrupt, starting empty: {err}",
                    self.path.display()
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_all(&self, items: &BTreeMap<String, String>) -> AppResult<()> {
        let serialized = serde_json::to_string_pretty(items)
            .map_err(|err| AppError::storage(format!("Failed to encode storage file: {err}")))?;
        write_file_atomically(&self.path, format!("{serialized}\n").as_bytes())?;
        set_secure_file_permissions(&self.path)
    }

    fn update<F>(&self, change: F) -> AppResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = self.read_all()?;
        change(&mut items);
        self.write_all(&items)
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> AppResult<Option<String>> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_all()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> AppResult<()> {
        self.update(|items| {
            items.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_item(&self, key: &str) -> AppResult<()> {
        self.update(|items| {
            items.remove(key);
        })
    }
}

pub(crate) fn write_file_atomically(path: &Path, contents: &[u8]) -> AppResult<()> {
    let dir = path.parent().ok_or_else(|| {
        AppError::storage(format!(
            "Failed to resolve parent directory for {}",
            path.display()
        ))
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let tmp_path = dir.join(format!(".{file_name}.tmp-{}-{nonce}", std::process::id()));

    {
        let mut tmp_file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(|err| {
                AppError::storage(format!(
                    "Failed to create temporary file {}: {err}",
                    tmp_path.display()
                ))
            })?;

        tmp_file.write_all(contents).map_err(|err| {
            AppError::storage(format!(
                "Failed to write temporary file {}: {err}",
                tmp_path.display()
            ))
        })?;

        tmp_file.sync_all().map_err(|err| {
            AppError::storage(format!(
                "Failed to sync temporary file {}: {err}",
                tmp_path.display()
            ))
        })?;
    }

    fs::rename(&tmp_path, path).map_err(|err| {
        let _ = fs::remove_file(&tmp_path);
        AppError::storage(format!(
            "Failed to atomically replace {} with {}: {err}",
            path.display(),
            tmp_path.display()
        ))
    })
}

pub(crate) fn set_secure_file_permissions(path: &Path) -> AppResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|err| {
            AppError::storage(format!(
                "Failed to set secure permissions on file {}: {err}",
                path.display()
            ))
        })?;
    }

    Ok(())
}

pub(crate) fn set_secure_dir_permissions(path: &Path) -> AppResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|err| {
            AppError::storage(format!(
                "Failed to set secure permissions on directory {}: {err}",
                path.display()
            ))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.set_item("servicecode", "\"airtable\"").unwrap();
        storage.set_item("apiblock.editingId", "null").unwrap();
        storage.remove_item("apiblock.editingId").unwrap();

        let reopened = FileStorage::new(dir.path());
        assert_eq!(
            reopened.get_item("servicecode").unwrap().as_deref(),
            Some("\"airtable\"")
        );
        assert!(reopened.get_item("apiblock.editingId").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "[[[").unwrap();

        let storage = FileStorage::at(path);
        assert!(storage.get_item("servicecode").unwrap().is_none());
        storage.set_item("servicecode", "\"gmail\"").unwrap();
        assert_eq!(
            storage.get_item("servicecode").unwrap().as_deref(),
            Some("\"gmail\"")
        );
    }
}
