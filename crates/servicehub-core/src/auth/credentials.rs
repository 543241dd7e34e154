//! Secure storage for the token pair and the cached user profile.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::Identity;

/// Default keychain service name
pub const DEFAULT_SERVICE_NAME: &str = "servicehub";

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const PROFILE_KEY: &str = "user";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("secure storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

/// Raw key/value access to a secret store.
pub trait SecretBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// OS keychain backend. Values survive process restarts.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Entry::new(&self.service, key)
            .map_err(|e| StorageError::Unavailable(format!("failed to create keyring entry: {}", e)))
    }
}

impl SecretBackend for KeyringBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Unavailable(format!(
                "failed to read {} from keychain: {}",
                key, e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entry(key)?.set_password(value).map_err(|e| {
            StorageError::Unavailable(format!("failed to store {} in keychain: {}", key, e))
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::Unavailable(format!(
                "failed to delete {} from keychain: {}",
                key, e
            ))),
        }
    }
}

/// In-process backend for tests and embedders without a keychain.
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// An access/refresh token pair from a single issuance.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens never end up in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProfile {
    pub identity: Identity,
    pub cached_at: DateTime<Utc>,
}

impl CachedProfile {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }
}

/// Typed credential storage.
///
/// Every read and write of the token pair happens under one lock, so a
/// reader never sees an access token from one issuance next to a refresh
/// token from another. Clone is cheap and shares the lock.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
    lock: Arc<AsyncMutex<()>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn keyring(service: &str) -> Self {
        Self::new(Arc::new(KeyringBackend::new(service)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Load the stored pair. A half-written pair counts as no credential.
    pub async fn load(&self) -> Result<Option<Credential>, StorageError> {
        let _guard = self.lock.lock().await;
        self.load_locked()
    }

    fn load_locked(&self) -> Result<Option<Credential>, StorageError> {
        let access = self.backend.get(ACCESS_TOKEN_KEY)?;
        let refresh = self.backend.get(REFRESH_TOKEN_KEY)?;

        match (access, refresh) {
            (Some(access), Some(refresh)) => Ok(Some(Credential::new(access, refresh))),
            (None, None) => Ok(None),
            _ => {
                warn!("Found incomplete token pair in secure storage, discarding");
                self.clear_locked()?;
                Ok(None)
            }
        }
    }

    pub async fn access_token(&self) -> Result<Option<String>, StorageError> {
        Ok(self.load().await?.map(|c| c.access_token))
    }

    pub async fn refresh_token(&self) -> Result<Option<String>, StorageError> {
        Ok(self.load().await?.map(|c| c.refresh_token))
    }

    /// Replace the stored pair with a freshly issued one.
    pub async fn store(&self, credential: &Credential) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        self.write_locked(credential)
    }

    fn write_locked(&self, credential: &Credential) -> Result<(), StorageError> {
        // Access token goes last so that an interrupted write leaves at most
        // a lone refresh token, never a pair from two issuances.
        let result = self
            .backend
            .delete(ACCESS_TOKEN_KEY)
            .and_then(|()| self.backend.set(REFRESH_TOKEN_KEY, &credential.refresh_token))
            .and_then(|()| self.backend.set(ACCESS_TOKEN_KEY, &credential.access_token));

        if let Err(e) = result {
            // Never leave a dangling half pair behind.
            if let Err(cleanup) = self.clear_tokens_locked() {
                warn!(error = %cleanup, "Failed to roll back partial credential write");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Apply the result of a token refresh.
    ///
    /// `used_refresh` is the refresh token the exchange started from. When
    /// the stored pair no longer carries it (logout or a new login happened
    /// meanwhile) nothing is written and `None` is returned. A refresh
    /// response without a rotated refresh token keeps the current one.
    pub async fn rotate(
        &self,
        used_refresh: &str,
        access_token: &str,
        rotated_refresh: Option<&str>,
    ) -> Result<Option<Credential>, StorageError> {
        let _guard = self.lock.lock().await;

        match self.load_locked()? {
            Some(current) if current.refresh_token == used_refresh => {
                let next = Credential::new(
                    access_token,
                    rotated_refresh.unwrap_or(&current.refresh_token),
                );
                self.write_locked(&next)?;
                debug!(rotated = rotated_refresh.is_some(), "Stored refreshed credential");
                Ok(Some(next))
            }
            _ => Ok(None),
        }
    }

    /// Remove the token pair and the cached profile.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        self.clear_locked()
    }

    fn clear_locked(&self) -> Result<(), StorageError> {
        self.clear_tokens_locked()?;
        self.backend.delete(PROFILE_KEY)
    }

    fn clear_tokens_locked(&self) -> Result<(), StorageError> {
        // Access first: a crash in between leaves a lone refresh token,
        // which load() treats as absent.
        let access = self.backend.delete(ACCESS_TOKEN_KEY);
        let refresh = self.backend.delete(REFRESH_TOKEN_KEY);
        access.and(refresh)
    }

    pub async fn load_profile(&self) -> Result<Option<CachedProfile>, StorageError> {
        let _guard = self.lock.lock().await;
        match self.backend.get(PROFILE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::Corrupt(format!("cached profile: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn store_profile(&self, identity: &Identity) -> Result<(), StorageError> {
        let raw = serde_json::to_string(&CachedProfile::new(identity.clone()))
            .map_err(|e| StorageError::Corrupt(format!("cached profile: {}", e)))?;
        let _guard = self.lock.lock().await;
        self.backend.set(PROFILE_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    /// Backend whose writes fail after a configurable number of calls.
    struct FlakyBackend {
        inner: MemoryBackend,
        writes_allowed: Mutex<usize>,
    }

    impl FlakyBackend {
        fn new(writes_allowed: usize) -> Self {
            Self {
                inner: MemoryBackend::new(),
                writes_allowed: Mutex::new(writes_allowed),
            }
        }
    }

    impl SecretBackend for FlakyBackend {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let mut allowed = self.writes_allowed.lock().unwrap();
            if *allowed == 0 {
                return Err(StorageError::Unavailable("keychain locked".to_string()));
            }
            *allowed -= 1;
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key)
        }
    }

    /// Backend that stops applying anything after a number of operations,
    /// like a process killed in the middle of a write.
    struct CrashingBackend {
        inner: Arc<MemoryBackend>,
        ops_left: Mutex<usize>,
    }

    impl CrashingBackend {
        fn tick(&self) -> Result<(), StorageError> {
            let mut left = self.ops_left.lock().unwrap();
            if *left == 0 {
                return Err(StorageError::Unavailable("process exited".to_string()));
            }
            *left -= 1;
            Ok(())
        }
    }

    impl SecretBackend for CrashingBackend {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.tick()?;
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.tick()?;
            self.inner.delete(key)
        }
    }

    struct BrokenBackend;

    impl SecretBackend for BrokenBackend {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("no keychain".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("no keychain".to_string()))
        }
        fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("no keychain".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_and_load_pair() {
        let store = CredentialStore::in_memory();
        assert_eq!(store.load().await.unwrap(), None);

        store.store(&Credential::new("T1", "R1")).await.unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            Some(Credential::new("T1", "R1"))
        );
        assert_eq!(store.access_token().await.unwrap().as_deref(), Some("T1"));
        assert_eq!(store.refresh_token().await.unwrap().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_dangling_access_token_reads_as_absent() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set(ACCESS_TOKEN_KEY, "T1").unwrap();
        let store = CredentialStore::new(backend.clone());

        assert_eq!(store.load().await.unwrap(), None);
        // The orphan is removed as well
        assert_eq!(backend.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_half_pair() {
        // Refresh token write succeeds, access token write fails
        let store = CredentialStore::new(Arc::new(FlakyBackend::new(1)));

        let err = store.store(&Credential::new("T1", "R1")).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_interrupted_rotation_never_mixes_issuances() {
        let keychain = Arc::new(MemoryBackend::new());
        CredentialStore::new(keychain.clone())
            .store(&Credential::new("T1", "R1"))
            .await
            .unwrap();

        for ops in 0..3 {
            let store = CredentialStore::new(Arc::new(CrashingBackend {
                inner: keychain.clone(),
                ops_left: Mutex::new(ops),
            }));
            assert!(store.rotate("R1", "T2", Some("R2")).await.is_err());

            // What the next launch finds
            let after_restart = CredentialStore::new(keychain.clone()).load().await.unwrap();
            assert!(
                after_restart.is_none() || after_restart == Some(Credential::new("T1", "R1")),
                "mixed pair after crash at op {ops}: {after_restart:?}"
            );
            CredentialStore::new(keychain.clone())
                .store(&Credential::new("T1", "R1"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_rotate_keeps_refresh_token_when_not_rotated() {
        let store = CredentialStore::in_memory();
        store.store(&Credential::new("T1", "R1")).await.unwrap();

        let next = store.rotate("R1", "T2", None).await.unwrap();
        assert_eq!(next, Some(Credential::new("T2", "R1")));
        assert_eq!(store.load().await.unwrap(), Some(Credential::new("T2", "R1")));
    }

    #[tokio::test]
    async fn test_rotate_writes_rotated_pair() {
        let store = CredentialStore::in_memory();
        store.store(&Credential::new("T1", "R1")).await.unwrap();

        store.rotate("R1", "T2", Some("R2")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(Credential::new("T2", "R2")));
    }

    #[tokio::test]
    async fn test_rotate_after_logout_writes_nothing() {
        let store = CredentialStore::in_memory();
        store.store(&Credential::new("T1", "R1")).await.unwrap();
        store.clear().await.unwrap();

        assert_eq!(store.rotate("R1", "T2", Some("R2")).await.unwrap(), None);
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rotate_after_relogin_keeps_new_session() {
        let store = CredentialStore::in_memory();
        store.store(&Credential::new("T9", "R9")).await.unwrap();

        assert_eq!(store.rotate("R1", "T2", None).await.unwrap(), None);
        assert_eq!(store.load().await.unwrap(), Some(Credential::new("T9", "R9")));
    }

    #[tokio::test]
    async fn test_clear_removes_profile() {
        let store = CredentialStore::in_memory();
        let identity: Identity =
            serde_json::from_str(r#"{"id": 7, "email": "c@d.com", "role": "consumer"}"#).unwrap();
        store.store(&Credential::new("T1", "R1")).await.unwrap();
        store.store_profile(&identity).await.unwrap();

        let cached = store.load_profile().await.unwrap().unwrap();
        assert_eq!(cached.identity.role(), Role::Consumer);
        assert!(cached.age_minutes() <= 1);

        store.clear().await.unwrap();
        assert!(store.load_profile().await.unwrap().is_none());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_backend_reports_storage_error() {
        let store = CredentialStore::new(Arc::new(BrokenBackend));
        assert!(matches!(
            store.load().await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let debug = format!("{:?}", Credential::new("secret-access", "secret-refresh"));
        assert!(!debug.contains("secret"));
    }
}
