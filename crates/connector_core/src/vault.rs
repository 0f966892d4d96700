//! Secret store capability (`dataspace:vault`).
//!
//! The runtime loads one optional `VaultExtension` before any service
//! extension is discovered, so every module can inject the vault.

use crate::monitor::Monitor;
use crate::system::capability::{ServiceKey, CAPABILITY_VAULT};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock};

pub type VaultResult<T> = Result<T, VaultError>;

pub const VAULT: ServiceKey<dyn Vault> = ServiceKey::new(CAPABILITY_VAULT);

/// Key/value secret store.
pub trait Vault: Send + Sync {
    /// Returns the secret stored under `key`, if any.
    fn resolve_secret(&self, key: &str) -> Option<String>;

    fn store_secret(&self, key: &str, value: &str) -> VaultResult<()>;

    fn delete_secret(&self, key: &str) -> VaultResult<()>;
}

/// Extension point supplying the process vault.
pub trait VaultExtension: Send {
    fn name(&self) -> &str;

    /// Prepares the vault; called once before `vault()`.
    fn initialize(&mut self, _monitor: &dyn Monitor) -> VaultResult<()> {
        Ok(())
    }

    fn vault(&self) -> Arc<dyn Vault>;
}

/// Process-local vault used when no `VaultExtension` is discovered.
#[derive(Debug, Default)]
pub struct InMemoryVault {
    secrets: RwLock<BTreeMap<String, String>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vault for InMemoryVault {
    fn resolve_secret(&self, key: &str) -> Option<String> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn store_secret(&self, key: &str, value: &str) -> VaultResult<()> {
        if key.trim().is_empty() {
            return Err(VaultError::InvalidKey(key.to_string()));
        }
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> VaultResult<()> {
        let removed = self
            .secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match removed {
            Some(_) => Ok(()),
            None => Err(VaultError::SecretNotFound(key.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    InvalidKey(String),
    SecretNotFound(String),
    Backend(String),
}

impl Display for VaultError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey(key) => write!(f, "secret key is invalid: `{key}`"),
            Self::SecretNotFound(key) => write!(f, "secret not found: `{key}`"),
            Self::Backend(message) => write!(f, "vault backend failure: {message}"),
        }
    }
}

impl Error for VaultError {}
