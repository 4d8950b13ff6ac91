// credentials.rs - Bearer token storage behind the OS keychain

use crate::{Error, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "com.syncbridge.engine";
const TOKEN_KEY: &str = "bearer_token";

/// Black-box credential storage.
///
/// The interceptor reads the token immediately before each send; tokens are
/// never written into queued request rows.
pub trait CredentialStore: Send + Sync {
    fn set_token(&self, token: &str) -> Result<()>;
    fn get_token(&self) -> Result<Option<String>>;
    fn clear_token(&self) -> Result<()>;
}

/// OS-keychain-backed store
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, TOKEN_KEY)
            .map_err(|e| Error::Credential(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn set_token(&self, token: &str) -> Result<()> {
        self.entry()?
            .set_password(token)
            .map_err(|e| Error::Credential(format!("Failed to save token: {}", e)))?;

        tracing::info!("Credential token saved");
        Ok(())
    }

    fn get_token(&self) -> Result<Option<String>> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Credential(format!("Failed to read token: {}", e))),
        }
    }

    fn clear_token(&self) -> Result<()> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                tracing::info!("Credential token cleared");
                Ok(())
            }
            Err(e) => Err(Error::Credential(format!("Failed to delete token: {}", e))),
        }
    }
}

/// In-memory store for tests and embedded hosts without a keychain
#[derive(Default)]
pub struct MemoryStore {
    token: std::sync::RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        Self {
            token: std::sync::RwLock::new(Some(token.to_string())),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn set_token(&self, token: &str) -> Result<()> {
        let mut slot = self
            .token
            .write()
            .map_err(|_| Error::Credential("Credential lock poisoned".to_string()))?;
        *slot = Some(token.to_string());
        Ok(())
    }

    fn get_token(&self) -> Result<Option<String>> {
        let slot = self
            .token
            .read()
            .map_err(|_| Error::Credential("Credential lock poisoned".to_string()))?;
        Ok(slot.clone())
    }

    fn clear_token(&self) -> Result<()> {
        let mut slot = self
            .token
            .write()
            .map_err(|_| Error::Credential("Credential lock poisoned".to_string()))?;
        *slot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryStore::new();
        assert!(store.get_token().unwrap().is_none());

        store.set_token("secret").unwrap();
        assert_eq!(store.get_token().unwrap().as_deref(), Some("secret"));

        store.clear_token().unwrap();
        assert!(store.get_token().unwrap().is_none());

        // Clearing an empty store is fine
        store.clear_token().unwrap();
    }
}
