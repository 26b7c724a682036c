//! Display name handling and the small key/value store that keeps it between
//! visits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{AppError, Result};

const USERNAME_KEY: &str = "username";
pub const USERNAME_MIN_LEN: usize = 5;
pub const USERNAME_MAX_LEN: usize = 20;

/// A single-string-per-key store that survives across visits.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Previously stored display name, or an empty string.
pub fn load_username(storage: &dyn LocalStorage) -> String {
    storage.get(USERNAME_KEY).unwrap_or_default()
}

pub fn is_valid_username(name: &str) -> bool {
    (USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&name.chars().count())
}

/// Stores `name` for the next visit if its length is within bounds.
pub fn validate_and_store(storage: &dyn LocalStorage, name: &str) -> Result<()> {
    if !is_valid_username(name) {
        return Err(AppError::InvalidUsername);
    }
    storage.set(USERNAME_KEY, name)
}

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| AppError::Other(anyhow::anyhow!("storage lock poisoned")))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON object on disk, rewritten on every `set`.
pub struct FileStorage {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| AppError::Other(anyhow::anyhow!("storage lock poisoned")))?;
        let mut next = values.clone();
        next.insert(key.to_string(), value.to_string());
        std::fs::write(&self.path, serde_json::to_string_pretty(&next)?)?;
        *values = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_storage_gives_empty_name() {
        assert_eq!(load_username(&MemoryStorage::new()), "");
    }

    #[test]
    fn accepts_names_within_bounds() {
        for len in USERNAME_MIN_LEN..=USERNAME_MAX_LEN {
            let storage = MemoryStorage::new();
            let name = "x".repeat(len);
            validate_and_store(&storage, &name).unwrap();
            assert_eq!(load_username(&storage), name);
        }
    }

    #[test]
    fn rejects_names_out_of_bounds_without_touching_storage() {
        let storage = MemoryStorage::new();
        validate_and_store(&storage, "alice").unwrap();
        for len in [0, 4, 21, 40] {
            let err = validate_and_store(&storage, &"y".repeat(len)).unwrap_err();
            assert!(matches!(err, AppError::InvalidUsername));
            assert_eq!(load_username(&storage), "alice");
        }
    }

    #[test]
    fn counts_characters_not_bytes() {
        assert!(is_valid_username("ñandú"));
        assert!(!is_valid_username("ñañá"));
    }

    #[test]
    fn file_storage_survives_reopen() {
        let path = std::env::temp_dir().join(format!("webrtc-rooms-{}.json", rand::random::<u64>()));
        {
            let storage = FileStorage::open(&path).unwrap();
            validate_and_store(&storage, "bob_the_builder").unwrap();
        }
        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(load_username(&storage), "bob_the_builder");
        let _ = std::fs::remove_file(&path);
    }
}
