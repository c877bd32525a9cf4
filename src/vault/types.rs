//! Vault Schema Types
//!
//! Plaintext schemas for the three encrypted stores: connection profiles,
//! credential entries and key material. Secret-bearing types zeroize their
//! contents on drop; consumers take `Zeroizing` copies that live only as
//! long as the operation needing them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Current schema version for all three stores
pub const SCHEMA_VERSION: u32 = 1;

fn default_port() -> u16 {
    22
}

/// How a connection profile authenticates, by reference into the
/// credential or key-material store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileAuth {
    /// Password held as a credential entry
    Password { credential_id: String },
    /// Private key held as a key-material entry
    Key { key_id: String },
    /// Defer to a running key agent
    Agent,
}

/// A saved connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: String,
    pub version: u32,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: ProfileAuth,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ConnectionProfile {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: ProfileAuth,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: SCHEMA_VERSION,
            name: name.into(),
            group: None,
            host: host.into(),
            port,
            username: username.into(),
            auth,
            created_at: Utc::now(),
            last_used_at: None,
            tags: Vec::new(),
        }
    }

    /// Update last used timestamp
    pub fn touch(&mut self) {
        self.last_used_at = Some(Utc::now());
    }

    /// Display string (user@host:port, port elided when 22)
    pub fn display_string(&self) -> String {
        if self.port == 22 {
            format!("{}@{}", self.username, self.host)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        }
    }
}

/// Root schema of the configuration store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub version: u32,
    pub profiles: Vec<ConnectionProfile>,

    #[serde(default)]
    pub groups: Vec<String>,

    /// Recently used profile IDs, most recent first
    #[serde(default)]
    pub recent: Vec<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            profiles: Vec::new(),
            groups: Vec::new(),
            recent: Vec::new(),
        }
    }
}

impl VaultConfig {
    /// Adds a profile, replacing any existing one with the same ID.
    pub fn add_profile(&mut self, profile: ConnectionProfile) {
        self.profiles.retain(|p| p.id != profile.id);
        self.profiles.push(profile);
    }

    pub fn remove_profile(&mut self, id: &str) -> Option<ConnectionProfile> {
        let pos = self.profiles.iter().position(|p| p.id == id)?;
        self.recent.retain(|r| r != id);
        Some(self.profiles.remove(pos))
    }

    pub fn get_profile(&self, id: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Marks a profile as recently used and bumps its timestamp.
    pub fn mark_used(&mut self, id: &str) {
        self.recent.retain(|r| r != id);
        self.recent.insert(0, id.to_string());
        self.recent.truncate(10);

        if let Some(profile) = self.profiles.iter_mut().find(|p| p.id == id) {
            profile.touch();
        }
    }
}

/// Deployment environment a credential belongs to
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

/// One stored credential. The secret field is zeroized when the entry is
/// dropped or replaced.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CredentialEntry {
    pub id: String,
    pub name: String,
    pub username: String,
    pub secret: String,

    #[zeroize(skip)]
    #[serde(default)]
    pub environment: Environment,

    /// Glob-ish host pattern this credential applies to ("*" = any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_pattern: Option<String>,

    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl CredentialEntry {
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
        environment: Environment,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            username: username.into(),
            secret: secret.into(),
            environment,
            host_pattern: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this credential applies to the given host.
    pub fn matches_host(&self, host: &str) -> bool {
        match self.host_pattern.as_deref() {
            None | Some("*") => true,
            Some(pattern) => {
                if let Some(suffix) = pattern.strip_prefix("*.") {
                    host == suffix || host.ends_with(&format!(".{suffix}"))
                } else {
                    host == pattern
                }
            }
        }
    }
}

/// Root schema of the credential store
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CredentialBook {
    #[zeroize(skip)]
    pub version: u32,
    pub entries: Vec<CredentialEntry>,
}

impl Default for CredentialBook {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }
}

impl CredentialBook {
    pub fn add(&mut self, entry: CredentialEntry) {
        self.entries.retain(|e| e.id != entry.id);
        self.entries.push(entry);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn find(&self, id: &str) -> Option<&CredentialEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Credentials applicable to a host in a given environment.
    pub fn matching(&self, host: &str, environment: Environment) -> Vec<&CredentialEntry> {
        self.entries
            .iter()
            .filter(|e| e.environment == environment && e.matches_host(host))
            .collect()
    }

    /// Minimum-lifetime copy of a credential secret for a consumer about to
    /// authenticate. The copy zeroizes itself when dropped.
    pub fn secret_of(&self, id: &str) -> Option<Zeroizing<String>> {
        self.find(id).map(|e| Zeroizing::new(e.secret.clone()))
    }
}

/// Kind of stored key material
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// SSH authentication key
    Ssh,
    /// PGP signing/encryption key
    Pgp,
}

/// One stored private key. Private material zeroizes on drop.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyEntry {
    pub id: String,
    pub name: String,

    #[zeroize(skip)]
    pub kind: KeyKind,

    /// e.g. "ed25519", "rsa-4096"
    pub algorithm: String,

    pub public_key: String,
    pub private_key: String,

    /// Passphrase protecting the private key, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl KeyEntry {
    pub fn new(
        name: impl Into<String>,
        kind: KeyKind,
        algorithm: impl Into<String>,
        public_key: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            algorithm: algorithm.into(),
            public_key: public_key.into(),
            private_key: private_key.into(),
            passphrase: None,
            created_at: Utc::now(),
        }
    }
}

/// Root schema of the key-material store
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyRing {
    #[zeroize(skip)]
    pub version: u32,
    pub keys: Vec<KeyEntry>,
}

impl Default for KeyRing {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            keys: Vec::new(),
        }
    }
}

impl KeyRing {
    pub fn add(&mut self, key: KeyEntry) {
        self.keys.retain(|k| k.id != key.id);
        self.keys.push(key);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k.id != id);
        self.keys.len() != before
    }

    pub fn find(&self, id: &str) -> Option<&KeyEntry> {
        self.keys.iter().find(|k| k.id == id)
    }

    pub fn of_kind(&self, kind: KeyKind) -> Vec<&KeyEntry> {
        self.keys.iter().filter(|k| k.kind == kind).collect()
    }

    /// Minimum-lifetime copy of the private key for a consumer about to
    /// sign or authenticate.
    pub fn private_key_of(&self, id: &str) -> Option<Zeroizing<String>> {
        self.find(id).map(|k| Zeroizing::new(k.private_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_display() {
        let p = ConnectionProfile::new("Test", "example.com", 22, "user", ProfileAuth::Agent);
        assert_eq!(p.display_string(), "user@example.com");

        let p2 = ConnectionProfile::new("Test", "example.com", 2222, "user", ProfileAuth::Agent);
        assert_eq!(p2.display_string(), "user@example.com:2222");
    }

    #[test]
    fn config_add_remove_mark_used() {
        let mut config = VaultConfig::default();
        let profile =
            ConnectionProfile::new("Test", "example.com", 22, "user", ProfileAuth::Agent);
        let id = profile.id.clone();

        config.add_profile(profile);
        assert_eq!(config.profiles.len(), 1);

        config.mark_used(&id);
        assert_eq!(config.recent, vec![id.clone()]);
        assert!(config.get_profile(&id).unwrap().last_used_at.is_some());

        assert!(config.remove_profile(&id).is_some());
        assert!(config.profiles.is_empty());
        assert!(config.recent.is_empty());
    }

    #[test]
    fn credential_host_matching() {
        let mut entry =
            CredentialEntry::new("db", "admin", "s3cret", Environment::Production);
        assert!(entry.matches_host("anything.example.com"));

        entry.host_pattern = Some("*.example.com".into());
        assert!(entry.matches_host("db.example.com"));
        assert!(entry.matches_host("example.com"));
        assert!(!entry.matches_host("example.org"));

        entry.host_pattern = Some("exact.host".into());
        assert!(entry.matches_host("exact.host"));
        assert!(!entry.matches_host("other.host"));
    }

    #[test]
    fn credential_book_lookup() {
        let mut book = CredentialBook::default();
        let entry = CredentialEntry::new("db", "admin", "s3cret", Environment::Staging);
        let id = entry.id.clone();
        book.add(entry);

        let matches = book.matching("db.internal", Environment::Staging);
        assert_eq!(matches.len(), 1);
        assert!(book.matching("db.internal", Environment::Production).is_empty());

        let secret = book.secret_of(&id).unwrap();
        assert_eq!(secret.as_str(), "s3cret");

        assert!(book.remove(&id));
        assert!(book.secret_of(&id).is_none());
    }

    #[test]
    fn keyring_lookup() {
        let mut ring = KeyRing::default();
        let key = KeyEntry::new("deploy", KeyKind::Ssh, "ed25519", "pub", "priv");
        let id = key.id.clone();
        ring.add(key);

        assert_eq!(ring.of_kind(KeyKind::Ssh).len(), 1);
        assert!(ring.of_kind(KeyKind::Pgp).is_empty());
        assert_eq!(ring.private_key_of(&id).unwrap().as_str(), "priv");
    }
}
