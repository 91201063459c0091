use crate::infrastructure::error::InfraError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const USER_ID_KEY: &str = "userId";

/// Small string secrets kept outside the record store.
pub trait SecureStringStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError>;
    fn set(&self, key: &str, value: &str) -> Result<(), InfraError>;
    fn delete(&self, key: &str) -> Result<(), InfraError>;
}

/// OS keychain entries under one service name; the key is the account.
#[derive(Debug, Clone)]
pub struct KeyringStringStore {
    service_name: String,
}

impl KeyringStringStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, key)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringStringStore {
    fn default() -> Self {
        Self::new("pomodolog")
    }
}

impl SecureStringStore for KeyringStringStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), InfraError> {
        match self.entry(key)?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemorySecureStringStore {
    values: Mutex<HashMap<String, String>>,
    unreadable: AtomicBool,
}

impl InMemorySecureStringStore {
    /// Makes `get` fail the way a locked keychain does.
    pub fn set_unreadable(&self, unreadable: bool) {
        self.unreadable.store(unreadable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, InfraError> {
        self.values
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))
    }
}

impl SecureStringStore for InMemorySecureStringStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(InfraError::Credential("secure store is locked".to_string()));
        }
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), InfraError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
