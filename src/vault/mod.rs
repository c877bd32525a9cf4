//! Encrypted Vault Module
//!
//! Master-password key derivation, the generic authenticated-encryption
//! file store and the three concrete stores built on it (configuration,
//! credentials, key material).
//!
//! Only a salt and a one-way verifier are ever written to disk; the derived
//! secret lives in memory for the lifetime of the unlocked core and is
//! zeroized on drop.

pub mod kdf;
pub mod store;
pub mod stores;
pub mod types;

pub use kdf::{AuthError, KdfService, MasterSecret, AUTH_FILE};
pub use store::{EncryptedStore, VaultError, VAULT_VERSION};
pub use stores::{
    ConfigurationStore, CredentialStore, KeyMaterialStore, CONFIG_FILE, CREDENTIALS_FILE,
    KEYS_FILE,
};
pub use types::{
    ConnectionProfile, CredentialBook, CredentialEntry, Environment, KeyEntry, KeyKind, KeyRing,
    ProfileAuth, VaultConfig, SCHEMA_VERSION,
};
