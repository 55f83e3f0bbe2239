//! Terminal credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. The three credentials — remote
//! authority URL, API key, terminal id — can be set individually or
//! imported in one step from a pairing connection string issued by the
//! admin dashboard.

use keyring::Entry;
use tracing::{info, warn};

use crate::remote::{self, RemoteConfig};

const SERVICE_NAME: &str = "tillsync";

// Credential keys
const KEY_REMOTE_URL: &str = "remote_authority_url";
const KEY_API_KEY: &str = "pos_api_key";
const KEY_TERMINAL_ID: &str = "terminal_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_API_KEY, KEY_TERMINAL_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
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

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The terminal is considered paired when remote URL, terminal id, and API
/// key are all present in the credential store.
pub fn is_configured() -> bool {
    has_credential(KEY_REMOTE_URL) && has_credential(KEY_TERMINAL_ID) && has_credential(KEY_API_KEY)
}

/// Build a [`RemoteConfig`] from the stored credentials, or `None` when the
/// terminal has not been paired yet.
pub fn remote_config() -> Option<RemoteConfig> {
    let base_url = get_credential(KEY_REMOTE_URL)?;
    let api_key = get_credential(KEY_API_KEY)?;
    let terminal_id = get_credential(KEY_TERMINAL_ID)?;
    Some(RemoteConfig::new(&base_url, &api_key, &terminal_id))
}

/// Import a pairing connection string (raw JSON or base64 of it) and store
/// the decoded credentials. The string must carry at least the API key and
/// terminal id; the URL may come from the string or already be stored.
pub fn import_connection_string(raw: &str) -> Result<RemoteConfig, String> {
    let details = remote::decode_connection_string(raw)
        .ok_or("Unrecognized connection string — expected JSON or base64-encoded JSON")?;

    let terminal_id = details
        .terminal_id
        .ok_or("Connection string is missing the terminal id")?;
    let base_url = match details.base_url {
        Some(url) => url,
        None => get_credential(KEY_REMOTE_URL)
            .ok_or("Connection string has no URL and none is stored")?,
    };

    set_credential(KEY_API_KEY, &details.api_key)?;
    set_credential(KEY_TERMINAL_ID, &terminal_id)?;
    set_credential(KEY_REMOTE_URL, &base_url)?;

    info!(terminal_id = %terminal_id, "terminal credentials imported");
    Ok(RemoteConfig::new(&base_url, &details.api_key, &terminal_id))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<(), String> {
    info!("performing factory reset – deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Keyring-backed round trips need a platform secret service, which CI
    // machines usually lack; decode failures are rejected before any
    // keyring access, so those paths are testable anywhere.

    #[test]
    fn test_import_rejects_garbage_before_touching_keyring() {
        let err = import_connection_string("definitely not a pairing string").unwrap_err();
        assert!(err.contains("Unrecognized connection string"));
    }

    #[test]
    fn test_import_requires_terminal_id() {
        let err = import_connection_string(r#"{"key": "sk-1", "url": "x.example.com"}"#)
            .unwrap_err();
        assert!(err.contains("terminal id"));
    }
}
