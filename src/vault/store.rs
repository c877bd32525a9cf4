//! Generic encrypted file store.
//!
//! Serializes a schema type with MessagePack, seals it with
//! XChaCha20-Poly1305 under the master secret and writes the result
//! atomically (temp file + rename), so a crash mid-write always leaves the
//! previous valid file intact. Every save uses a freshly generated random
//! 24-byte nonce; nonce reuse under the same key is forbidden.
//!
//! On-disk layout: magic `FTVT` | version byte | nonce | ciphertext.
//! The header is bound as associated data, and the Poly1305 tag must
//! validate before any plaintext is trusted.

use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use zeroize::Zeroizing;

use super::kdf::MasterSecret;

/// Vault file magic bytes
const VAULT_MAGIC: &[u8; 4] = b"FTVT";

/// Vault file format version
pub const VAULT_VERSION: u8 = 1;

const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = VAULT_MAGIC.len() + 1 + NONCE_LEN;

/// Vault store errors
#[derive(Debug, Error)]
pub enum VaultError {
    /// No vault file exists yet; callers use a default-initialized value.
    #[error("vault file does not exist")]
    Missing,

    /// Integrity check failed: wrong secret, bit rot or tampering.
    /// Never downgraded to a default value.
    #[error("vault file failed integrity check (wrong secret or tampering)")]
    Tampered,

    /// Decryption succeeded but the payload does not deserialize.
    #[error("vault payload is corrupt: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("encryption failure")]
    Crypto,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes `bytes` to a temp file in the same directory and renames it over
/// `path` once the write is flushed, so the previous file survives a crash
/// mid-write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Encrypted-at-rest store for one schema type at one file path.
///
/// Saves to the same file are serialized through `write_gate`; the shared
/// `file_lock` is held for reading during saves so the backup coordinator
/// can exclude all writers while copying files.
pub struct EncryptedStore<T> {
    path: PathBuf,
    file_lock: Arc<RwLock<()>>,
    write_gate: Mutex<()>,
    _schema: PhantomData<fn() -> T>,
}

impl<T> EncryptedStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: PathBuf, file_lock: Arc<RwLock<()>>) -> Self {
        Self {
            path,
            file_lock,
            write_gate: Mutex::new(()),
            _schema: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the vault file, verifies the authentication tag, decrypts and
    /// deserializes.
    pub async fn load(&self, secret: &MasterSecret) -> Result<T, VaultError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(VaultError::Missing),
            Err(e) => return Err(e.into()),
        };
        let value = open_payload(secret, &bytes)?;
        debug!(path = %self.path.display(), "vault file loaded");
        Ok(value)
    }

    /// Like [`load`](Self::load), but maps a missing file to `T::default()`.
    /// Integrity failures are still surfaced.
    pub async fn load_or_default(&self, secret: &MasterSecret) -> Result<T, VaultError>
    where
        T: Default,
    {
        match self.load(secret).await {
            Err(VaultError::Missing) => Ok(T::default()),
            other => other,
        }
    }

    /// Serializes, encrypts with a fresh nonce and writes atomically.
    pub async fn save(&self, secret: &MasterSecret, value: &T) -> Result<(), VaultError> {
        let framed = seal_payload(secret, value)?;

        // Same-file saves are mutually exclusive; the shared lock lets
        // saves to different stores proceed while excluding backups.
        let _exclusive = self.write_gate.lock().await;
        let _shared = self.file_lock.read().await;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &framed))
            .await
            .map_err(|e| {
                VaultError::Io(std::io::Error::other(format!("task join error: {}", e)))
            })??;

        debug!(path = %self.path.display(), "vault file saved");
        Ok(())
    }
}

fn seal_payload<T: Serialize>(secret: &MasterSecret, value: &T) -> Result<Vec<u8>, VaultError> {
    let plain = Zeroizing::new(
        rmp_serde::to_vec_named(value).map_err(|e| VaultError::Serialization(e.to_string()))?,
    );

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(VAULT_MAGIC);
    header.push(VAULT_VERSION);
    header.extend_from_slice(&nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret.expose()));
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &plain,
                aad: &header,
            },
        )
        .map_err(|_| VaultError::Crypto)?;

    let mut framed = header;
    framed.extend_from_slice(&ciphertext);
    Ok(framed)
}

fn open_payload<T: DeserializeOwned>(
    secret: &MasterSecret,
    bytes: &[u8],
) -> Result<T, VaultError> {
    // A truncated or rewritten header is indistinguishable from tampering.
    if bytes.len() < HEADER_LEN || &bytes[..VAULT_MAGIC.len()] != VAULT_MAGIC {
        return Err(VaultError::Tampered);
    }
    if bytes[VAULT_MAGIC.len()] != VAULT_VERSION {
        return Err(VaultError::Tampered);
    }
    let (header, ciphertext) = bytes.split_at(HEADER_LEN);
    let nonce = &header[VAULT_MAGIC.len() + 1..];

    let cipher = XChaCha20Poly1305::new(Key::from_slice(secret.expose()));
    let plain = Zeroizing::new(
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| VaultError::Tampered)?,
    );

    rmp_serde::from_slice(&plain).map_err(|e| VaultError::Corrupt(e.to_string()))
}
