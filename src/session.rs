//! Session storage using the OS credential store.
//!
//! Holds the bearer token and the minimal user profile the rest of the
//! app reads for role gating. On Windows this uses DPAPI (via the
//! `keyring` crate), on macOS Keychain, and on Linux the Secret Service
//! API. Reads degrade to `None` on platform errors; loss of the session
//! means a re-login, not a crash.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const KEY_TOKEN: &str = "session_token";
const KEY_PROFILE: &str = "user_profile";

/// All credential keys managed by this store.
const ALL_KEYS: &[&str] = &[KEY_TOKEN, KEY_PROFILE];

/// Handle to the credential store. Constructed once by the composition
/// root and injected where needed; the service name keys the platform
/// store, so tests can use a distinct one.
pub struct SessionStore {
    service: String,
}

impl SessionStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    // -----------------------------------------------------------------
    // Low-level helpers
    // -----------------------------------------------------------------

    /// Retrieve a single credential. Returns `None` when the entry does
    /// not exist (or the platform returns a "not found" error).
    fn get_credential(&self, key: &str) -> Option<String> {
        let entry = match Entry::new(&self.service, key) {
            Ok(e) => e,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to create entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(pw) => Some(pw),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to read credential");
                None
            }
        }
    }

    fn set_credential(&self, key: &str, value: &str) -> Result<(), String> {
        let entry = Entry::new(&self.service, key).map_err(|e| e.to_string())?;
        entry.set_password(value).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Delete a credential. Silently succeeds if the entry does not exist.
    fn delete_credential(&self, key: &str) -> Result<(), String> {
        let entry = Entry::new(&self.service, key).map_err(|e| e.to_string())?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    // -----------------------------------------------------------------
    // High-level API
    // -----------------------------------------------------------------

    /// The bearer token attached to outgoing requests, if a session exists.
    pub fn token(&self) -> Option<String> {
        self.get_credential(KEY_TOKEN)
            .filter(|t| !t.trim().is_empty())
    }

    pub fn set_token(&self, token: &str) -> Result<(), String> {
        self.set_credential(KEY_TOKEN, token.trim())
    }

    /// The stored user profile blob, parsed back to JSON.
    pub fn profile(&self) -> Option<Value> {
        self.get_credential(KEY_PROFILE)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub fn set_profile(&self, profile: &Value) -> Result<(), String> {
        let raw = serde_json::to_string(profile).map_err(|e| e.to_string())?;
        self.set_credential(KEY_PROFILE, &raw)
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// Delete every stored credential (logout).
    pub fn clear(&self) -> Result<(), String> {
        info!("clearing stored session credentials");
        for key in ALL_KEYS {
            self.delete_credential(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Once;

    static MOCK_STORE: Once = Once::new();

    fn test_store() -> SessionStore {
        // The default credential builder is process-global; swap in the
        // in-memory mock exactly once.
        MOCK_STORE.call_once(|| {
            keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        });
        SessionStore::new("pixel-nest-sync-test")
    }

    #[test]
    #[serial]
    fn test_token_round_trip_and_clear() {
        let store = test_store();
        store.clear().unwrap();

        assert!(store.token().is_none());
        assert!(!store.is_authenticated());

        store.set_token("  tok-123  ").unwrap();
        assert_eq!(store.token().as_deref(), Some("tok-123"));
        assert!(store.is_authenticated());

        store.clear().unwrap();
        assert!(store.token().is_none());
    }

    #[test]
    #[serial]
    fn test_profile_round_trip() {
        let store = test_store();
        store.clear().unwrap();

        let profile = serde_json::json!({ "username": "admin", "role": "owner" });
        store.set_profile(&profile).unwrap();
        assert_eq!(store.profile(), Some(profile));
    }

    #[test]
    #[serial]
    fn test_clear_is_idempotent() {
        let store = test_store();
        store.clear().unwrap();
        store.clear().unwrap();
    }
}
