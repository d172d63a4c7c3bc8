//! Durable and transient key/value storage for the session registry.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use atrium_api::types::string::Did;
use tracing::warn;

use crate::errors::StoreError;

/// JSON array of DIDs that have a (possibly stale) stored session
pub const STORED_DIDS_KEY: &str = "storedDids";
/// DID of the active account
pub const ACTIVE_USER_KEY: &str = "activeUser";
/// Transient: where to send the user once authorization completes
pub const OAUTH_REDIRECT_KEY: &str = "oauth-session-storage";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// All keys in one JSON object file. Every write replaces the file atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<HashMap<String, String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(serde_json::to_string_pretty(values)?.as_bytes())?;
        file.persist(&self.path)?;
        Ok(())
    }

    fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read()?;
        f(&mut values);
        self.write(&values)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Typed access to the registry's persisted state.
///
/// `durable` outlives the process; `transient` only has to survive the
/// round trip through the authorization server.
#[derive(Clone)]
pub struct SessionStore {
    durable: Arc<dyn KeyValueStore>,
    transient: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(durable: Arc<dyn KeyValueStore>, transient: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, transient }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    /// DIDs with a stored session, in the order they were added
    pub fn stored_dids(&self) -> Result<Vec<Did>, StoreError> {
        let Some(raw) = self.durable.get(STORED_DIDS_KEY)? else {
            return Ok(vec![]);
        };

        let values: Vec<String> = serde_json::from_str(&raw)?;
        let mut dids: Vec<Did> = Vec::with_capacity(values.len());
        for value in values {
            match Did::new(value.clone()) {
                Ok(did) if !dids.contains(&did) => dids.push(did),
                Ok(_) => {}
                Err(e) => warn!("Skipping unparseable stored DID {:?}: {}", value, e),
            }
        }

        Ok(dids)
    }

    pub fn set_stored_dids(&self, dids: &[Did]) -> Result<(), StoreError> {
        let values: Vec<&str> = dids.iter().map(|did| did.as_str()).collect();
        self.durable
            .set(STORED_DIDS_KEY, &serde_json::to_string(&values)?)
    }

    pub fn add_stored_did(&self, did: &Did) -> Result<(), StoreError> {
        let mut dids = self.stored_dids()?;
        if !dids.contains(did) {
            dids.push(did.clone());
            self.set_stored_dids(&dids)?;
        }
        Ok(())
    }

    pub fn remove_stored_did(&self, did: &Did) -> Result<(), StoreError> {
        let mut dids = self.stored_dids()?;
        let before = dids.len();
        dids.retain(|stored| stored != did);
        if dids.len() != before {
            self.set_stored_dids(&dids)?;
        }
        Ok(())
    }

    pub fn active_user(&self) -> Result<Option<Did>, StoreError> {
        Ok(self
            .durable
            .get(ACTIVE_USER_KEY)?
            .and_then(|raw| match Did::new(raw.clone()) {
                Ok(did) => Some(did),
                Err(e) => {
                    warn!("Ignoring unparseable active user {:?}: {}", raw, e);
                    None
                }
            }))
    }

    pub fn set_active_user(&self, did: Option<&Did>) -> Result<(), StoreError> {
        match did {
            Some(did) => self.durable.set(ACTIVE_USER_KEY, did.as_str()),
            None => self.durable.remove(ACTIVE_USER_KEY),
        }
    }

    pub fn save_redirect(&self, location: &str) -> Result<(), StoreError> {
        self.transient.set(OAUTH_REDIRECT_KEY, location)
    }

    /// Read the saved redirect and clear it; it is only ever used once
    pub fn take_redirect(&self) -> Result<Option<String>, StoreError> {
        let redirect = self.transient.get(OAUTH_REDIRECT_KEY)?;
        self.transient.remove(OAUTH_REDIRECT_KEY)?;
        Ok(redirect)
    }

    /// Forget every account and any pending redirect
    pub fn clear(&self) -> Result<(), StoreError> {
        self.durable.remove(STORED_DIDS_KEY)?;
        self.durable.remove(ACTIVE_USER_KEY)?;
        self.transient.remove(OAUTH_REDIRECT_KEY)
    }
}
