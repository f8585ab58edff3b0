//! Encrypted persistence for the session's token set.
//!
//! The store serializes the token set, seals it with ChaCha20-Poly1305 under
//! a key derived from the configured secret, and writes one blob under a
//! fixed namespaced key. Any decrypt or decode failure is treated as
//! corruption: the caller clears the entry and falls back to an
//! unauthenticated session instead of trusting a partially-decoded token.

use crate::error::Error;
use crate::token::{OrganizationContext, TokenSet, UserProfile};
use base64ct::{Base64, Encoding};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Namespaced key every blob is stored under.
pub const STORAGE_KEY: &str = "legitimi/session/v1";

const ALGORITHM_ID: &str = "chacha20-poly1305";
const NONCE_LEN: usize = 12;

/// Single-key persistence boundary. Implementations must make `put` and
/// `get` atomic per key; no partial writes are observable.
pub trait StorageBackend: Send + Sync {
    /// Replace the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the backend cannot persist the value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Read the value under `key`, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Remove the value under `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the backend cannot delete the value.
    fn delete(&self, key: &str) -> Result<(), Error>;
}

/// In-memory backend for tests and single-page sessions without persistence.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// File-backed storage for hosts with a private data directory.
///
/// Blobs are written with mode 0600 on unix. The ciphertext is what protects
/// the token; the permissions only narrow the blast radius.
#[derive(Debug)]
pub struct FileStorage {
    base_dir: std::path::PathBuf,
}

impl FileStorage {
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the directory cannot be created.
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Result<Self, Error> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)
            .map_err(|err| Error::Storage(format!("cannot create storage dir: {err}")))?;
        Ok(Self { base_dir })
    }

    fn key_path(&self, key: &str) -> std::path::PathBuf {
        // Keys are namespaced with '/'; flatten them to a single file name.
        let safe_key: String = key.replace(['/', '\\', '.'], "_");
        self.base_dir.join(safe_key)
    }
}

impl StorageBackend for FileStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let path = self.key_path(key);
        std::fs::write(&path, value).map_err(|err| Error::Storage(err.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|err| Error::Storage(err.to_string()))?;
        }

        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path)
            .map(Some)
            .map_err(|err| Error::Storage(err.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_file(&path).map_err(|err| Error::Storage(err.to_string()))
    }
}

/// The session record the store seals and restores across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedSession {
    pub token_set: TokenSet,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub organization: Option<OrganizationContext>,
}

/// What actually gets sealed: the record plus a freshness marker.
#[derive(Debug, Serialize, Deserialize)]
struct SealedPayload {
    session: PersistedSession,
    saved_at: DateTime<Utc>,
}

/// The stored envelope. `algorithm` guards against decrypting blobs written
/// by an incompatible build.
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedBlob {
    iv: String,
    ciphertext: String,
    algorithm: String,
}

/// Encrypting wrapper around a [`StorageBackend`].
pub struct SecureTokenStore {
    backend: Arc<dyn StorageBackend>,
    key: [u8; 32],
}

impl SecureTokenStore {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, secret: &SecretString) -> Self {
        let key = Sha256::digest(secret.expose_secret().as_bytes()).into();
        Self { backend, key }
    }

    /// Seal and persist `session` under [`STORAGE_KEY`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when encryption or the backend write fails.
    pub fn save(&self, session: &PersistedSession) -> Result<(), Error> {
        let payload = SealedPayload {
            session: session.clone(),
            saved_at: Utc::now(),
        };
        let plaintext = serde_json::to_vec(&payload)
            .map_err(|err| Error::Storage(format!("serialize: {err}")))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: STORAGE_KEY.as_bytes(),
                },
            )
            .map_err(|err| Error::Storage(format!("encrypt: {err}")))?;

        let blob = EncryptedBlob {
            iv: Base64::encode_string(&nonce_bytes),
            ciphertext: Base64::encode_string(&ciphertext),
            algorithm: ALGORITHM_ID.to_string(),
        };
        let bytes = serde_json::to_vec(&blob)
            .map_err(|err| Error::Storage(format!("serialize blob: {err}")))?;

        self.backend.put(STORAGE_KEY, &bytes)
    }

    /// Load and unseal the persisted session, `None` when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on any decryption or decode failure. The
    /// caller must [`clear`](Self::clear) the entry and treat the session as
    /// unauthenticated; a blob that fails to unseal is never partially
    /// trusted.
    pub fn load(&self) -> Result<Option<PersistedSession>, Error> {
        let Some(bytes) = self.backend.get(STORAGE_KEY)? else {
            return Ok(None);
        };

        let blob: EncryptedBlob = serde_json::from_slice(&bytes)
            .map_err(|err| Error::Storage(format!("malformed blob: {err}")))?;
        if blob.algorithm != ALGORITHM_ID {
            return Err(Error::Storage(format!(
                "unsupported algorithm: {}",
                blob.algorithm
            )));
        }

        let nonce_bytes = Base64::decode_vec(&blob.iv)
            .map_err(|_| Error::Storage("malformed iv".to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::Storage("invalid iv length".to_string()));
        }
        let ciphertext = Base64::decode_vec(&blob.ciphertext)
            .map_err(|_| Error::Storage("malformed ciphertext".to_string()))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: STORAGE_KEY.as_bytes(),
                },
            )
            .map_err(|_| Error::Storage("decryption failed".to_string()))?;

        let payload: SealedPayload = serde_json::from_slice(&plaintext)
            .map_err(|err| Error::Storage(format!("malformed payload: {err}")))?;
        Ok(Some(payload.session))
    }

    /// Remove the persisted blob. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the backend delete fails.
    pub fn clear(&self) -> Result<(), Error> {
        self.backend.delete(STORAGE_KEY)
    }
}

impl std::fmt::Debug for SecureTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureTokenStore")
            .field("key", &"***")
            .finish_non_exhaustive()
    }
}
