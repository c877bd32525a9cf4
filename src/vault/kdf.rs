//! Master password key derivation and verification.
//!
//! Derives the vault's symmetric secret from the master password with
//! Argon2id over a random stored salt. The auth file (`master.key`) carries
//! the salt, the KDF cost parameters and a one-way verifier; it never
//! contains the password or the derived secret. Verification recomputes the
//! derivation and compares the verifier in constant time.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::store::write_atomic;

/// Auth file name inside the vault directory
pub const AUTH_FILE: &str = "master.key";

/// Auth file format version
pub const AUTH_VERSION: u32 = 1;

/// Derived secret length in bytes
pub const SECRET_LEN: usize = 32;

const SALT_LEN: usize = 32;

/// Domain separation tag for the verifier hash
const VERIFIER_TAG: &[u8] = b"ferroterm.master.verifier.v1";

// Argon2id cost parameters for new vaults (memory in KiB). Existing vaults
// keep the parameters recorded in their auth file.
const DEFAULT_M_COST: u32 = 19 * 1024;
const DEFAULT_T_COST: u32 = 2;
const DEFAULT_P_COST: u32 = 1;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// Recoverable: the caller may re-prompt
    #[error("wrong master password")]
    WrongPassword,

    #[error("master password has not been set up")]
    NotInitialized,

    #[error("auth file is malformed: {0}")]
    Malformed(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The symmetric secret derived from the master password.
///
/// In-memory only. Zeroized on drop; never serialized, logged or persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; SECRET_LEN]);

impl MasterSecret {
    /// Raw key bytes for the AEAD layer. Crate-internal on purpose.
    pub(crate) fn expose(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// Persisted salt + verifier record
#[derive(Debug, Serialize, Deserialize)]
struct AuthFile {
    version: u32,
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
    salt: String,
    verifier: String,
}

/// Derives and verifies the master secret against the stored auth file.
pub struct KdfService {
    path: PathBuf,
}

impl KdfService {
    pub fn new(vault_dir: &Path) -> Self {
        Self {
            path: vault_dir.join(AUTH_FILE),
        }
    }

    /// Whether a master password has been set up for this vault.
    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    /// First run: derive a fresh salt and persist salt + verifier.
    /// Subsequent runs: re-derive and check the attempt against the verifier.
    ///
    /// The raw password is never persisted or logged. IO failures reading
    /// the auth file are fatal to unlocking; a wrong password is recoverable
    /// and retry policy belongs to the caller.
    pub fn initialize_or_unlock(&self, attempt: &str) -> Result<MasterSecret, AuthError> {
        if self.is_initialized() {
            self.unlock(attempt)
        } else {
            self.initialize(attempt)
        }
    }

    /// Changes the master password. Verifies the old password, then writes a
    /// fresh salt + verifier and returns the new secret. Re-encryption of
    /// the stores under the new secret is the caller's job.
    pub fn change_password(&self, old: &str, new: &str) -> Result<MasterSecret, AuthError> {
        if !self.is_initialized() {
            return Err(AuthError::NotInitialized);
        }
        // Verify the old password first; the old secret is dropped (and
        // zeroized) immediately.
        drop(self.unlock(old)?);

        let secret = self.initialize(new)?;
        info!("master password changed");
        Ok(secret)
    }

    fn initialize(&self, password: &str) -> Result<MasterSecret, AuthError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let secret = derive(password, &salt, DEFAULT_M_COST, DEFAULT_T_COST, DEFAULT_P_COST)?;
        let verifier = verifier_of(&secret);

        let record = AuthFile {
            version: AUTH_VERSION,
            m_cost: DEFAULT_M_COST,
            t_cost: DEFAULT_T_COST,
            p_cost: DEFAULT_P_COST,
            salt: BASE64.encode(salt),
            verifier: BASE64.encode(verifier),
        };
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;

        info!(path = %self.path.display(), "master password set up");
        Ok(secret)
    }

    fn unlock(&self, attempt: &str) -> Result<MasterSecret, AuthError> {
        let bytes = fs::read(&self.path)?;
        let record: AuthFile =
            serde_json::from_slice(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))?;
        if record.version != AUTH_VERSION {
            return Err(AuthError::Malformed(format!(
                "unsupported auth file version {}",
                record.version
            )));
        }

        let salt = BASE64
            .decode(&record.salt)
            .map_err(|e| AuthError::Malformed(format!("bad salt encoding: {e}")))?;
        let stored_verifier = BASE64
            .decode(&record.verifier)
            .map_err(|e| AuthError::Malformed(format!("bad verifier encoding: {e}")))?;

        let secret = derive(attempt, &salt, record.m_cost, record.t_cost, record.p_cost)?;
        let computed = verifier_of(&secret);

        if bool::from(computed.ct_eq(stored_verifier.as_slice())) {
            info!("master password verified");
            Ok(secret)
        } else {
            warn!("master password verification failed");
            Err(AuthError::WrongPassword)
        }
    }
}

fn derive(
    password: &str,
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
) -> Result<MasterSecret, AuthError> {
    let params = Params::new(m_cost, t_cost, p_cost, Some(SECRET_LEN))
        .map_err(|e| AuthError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; SECRET_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| AuthError::Kdf(e.to_string()))?;
    Ok(MasterSecret(out))
}

/// One-way verifier: a domain-separated hash of the derived key. Lets a
/// password attempt be checked without storing the key itself.
fn verifier_of(secret: &MasterSecret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(VERIFIER_TAG);
    hasher.update(secret.expose());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_run_then_unlock() {
        let dir = TempDir::new().unwrap();
        let kdf = KdfService::new(dir.path());
        assert!(!kdf.is_initialized());

        let first = kdf.initialize_or_unlock("correct-horse").unwrap();
        assert!(kdf.is_initialized());

        let again = kdf.initialize_or_unlock("correct-horse").unwrap();
        assert_eq!(first.expose(), again.expose());
    }

    #[test]
    fn wrong_password_rejected() {
        let dir = TempDir::new().unwrap();
        let kdf = KdfService::new(dir.path());
        kdf.initialize_or_unlock("correct-horse").unwrap();

        let err = kdf.initialize_or_unlock("wrong-password").unwrap_err();
        assert!(matches!(err, AuthError::WrongPassword));
    }

    #[test]
    fn different_passwords_derive_different_secrets() {
        let dir = TempDir::new().unwrap();
        let kdf = KdfService::new(dir.path());
        kdf.initialize_or_unlock("alpha").unwrap();

        // Same salt, different password, must not collide.
        let salt = [7u8; SALT_LEN];
        let a = derive("alpha", &salt, 8, 1, 1).unwrap();
        let b = derive("bravo", &salt, 8, 1, 1).unwrap();
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn change_password_invalidates_old() {
        let dir = TempDir::new().unwrap();
        let kdf = KdfService::new(dir.path());
        kdf.initialize_or_unlock("old-pass").unwrap();

        kdf.change_password("old-pass", "new-pass").unwrap();

        assert!(matches!(
            kdf.initialize_or_unlock("old-pass").unwrap_err(),
            AuthError::WrongPassword
        ));
        kdf.initialize_or_unlock("new-pass").unwrap();
    }

    #[test]
    fn change_password_requires_correct_old() {
        let dir = TempDir::new().unwrap();
        let kdf = KdfService::new(dir.path());
        kdf.initialize_or_unlock("old-pass").unwrap();

        assert!(matches!(
            kdf.change_password("bogus", "new-pass").unwrap_err(),
            AuthError::WrongPassword
        ));
    }

    #[test]
    fn malformed_auth_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let kdf = KdfService::new(dir.path());
        kdf.initialize_or_unlock("pw").unwrap();

        std::fs::write(dir.path().join(AUTH_FILE), b"not json").unwrap();
        assert!(matches!(
            kdf.initialize_or_unlock("pw").unwrap_err(),
            AuthError::Malformed(_)
        ));
    }

    #[test]
    fn auth_file_never_contains_password_material() {
        let dir = TempDir::new().unwrap();
        let kdf = KdfService::new(dir.path());
        let secret = kdf.initialize_or_unlock("hunter2-master").unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join(AUTH_FILE)).unwrap();
        assert!(!on_disk.contains("hunter2-master"));
        assert!(!on_disk.contains(&BASE64.encode(secret.expose())));
    }
}
