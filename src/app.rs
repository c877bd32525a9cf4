//! Application Core
//!
//! `TerminalCore` wires the vault, settings, backup and session layers
//! together behind one façade: unlock/lock, profile and credential
//! management, session open/close and ordered shutdown. The UI layer talks
//! to this type only.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::backup::{BackupCoordinator, BackupError, BackupSnapshot};
use crate::session::registry::CloseAllReport;
use crate::session::transport::{Endpoint, TransportConnector};
use crate::session::{SessionError, SessionHandle, SessionRegistry};
use crate::settings::{Settings, SettingsStore};
use crate::vault::kdf::{AuthError, KdfService, MasterSecret};
use crate::vault::store::VaultError;
use crate::vault::stores::{ConfigurationStore, CredentialStore, KeyMaterialStore};
use crate::vault::types::{
    ConnectionProfile, CredentialBook, CredentialEntry, KeyEntry, KeyRing, VaultConfig,
};

/// Top-level errors surfaced to the UI layer
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("vault is locked")]
    Locked,

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("shutdown already in progress")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of `shutdown`
#[derive(Debug)]
pub struct ShutdownReport {
    pub sessions: CloseAllReport,
    /// Whether the vault stores were flushed (false when locked)
    pub flushed: bool,
}

/// Decrypted working set, present only between unlock and lock. Dropping
/// it zeroizes the secret and every secret-bearing schema field.
struct Unlocked {
    secret: MasterSecret,
    config: VaultConfig,
    credentials: CredentialBook,
    keys: KeyRing,
}

/// The application core. One instance per vault directory.
pub struct TerminalCore {
    vault_dir: PathBuf,
    settings: Settings,
    settings_store: SettingsStore,
    kdf: KdfService,
    config_store: ConfigurationStore,
    credential_store: CredentialStore,
    key_store: KeyMaterialStore,
    backup: Arc<BackupCoordinator>,
    backup_task: Option<tokio::task::JoinHandle<()>>,
    sessions: SessionRegistry,
    unlocked: AsyncRwLock<Option<Unlocked>>,
    shutting_down: AtomicBool,
}

/// Default vault location under the platform data directory.
pub fn default_vault_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("ferroterm").join("vault"))
}

impl TerminalCore {
    /// Creates the vault directory if needed, loads settings and starts the
    /// scheduled-backup task when the policy asks for one. The vault itself
    /// stays locked until [`unlock`](Self::unlock).
    pub fn new(
        vault_dir: &Path,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(vault_dir)?;

        let settings_store = SettingsStore::new(vault_dir);
        let settings = settings_store.load();
        let file_lock = Arc::new(tokio::sync::RwLock::new(()));

        let backup = Arc::new(BackupCoordinator::new(
            vault_dir,
            settings.retention_policy(),
            Arc::clone(&file_lock),
        ));
        let backup_task = backup.spawn_interval_task();

        let sessions = SessionRegistry::new(connector, settings.connect_timeout());

        info!(vault = %vault_dir.display(), "core initialized");
        Ok(Self {
            vault_dir: vault_dir.to_path_buf(),
            kdf: KdfService::new(vault_dir),
            config_store: ConfigurationStore::new(vault_dir, Arc::clone(&file_lock)),
            credential_store: CredentialStore::new(vault_dir, Arc::clone(&file_lock)),
            key_store: KeyMaterialStore::new(vault_dir, file_lock),
            settings,
            settings_store,
            backup,
            backup_task,
            sessions,
            unlocked: AsyncRwLock::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn vault_dir(&self) -> &Path {
        &self.vault_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Read-only monitoring view of all tracked sessions.
    pub fn monitor_snapshot(&self) -> crate::session::RegistrySnapshot {
        self.sessions.snapshot()
    }

    pub fn backup(&self) -> &BackupCoordinator {
        &self.backup
    }

    /// Whether a master password has been set up for this vault directory.
    pub fn is_initialized(&self) -> bool {
        self.kdf.is_initialized()
    }

    pub async fn is_unlocked(&self) -> bool {
        self.unlocked.read().await.is_some()
    }

    /// First run sets up the master password; later runs verify it. On
    /// success the three stores are decrypted into memory. A wrong password
    /// leaves everything untouched and may be retried.
    pub async fn unlock(&self, password: &str) -> Result<(), CoreError> {
        let mut guard = self.unlocked.write().await;
        if guard.is_some() {
            // Already unlocked: the attempt is still verified so a wrong
            // password never looks like a success.
            drop(self.kdf.initialize_or_unlock(password)?);
            return Ok(());
        }

        let secret = self.kdf.initialize_or_unlock(password)?;
        let config = self.config_store.load_or_default(&secret).await?;
        let credentials = self.credential_store.load_or_default(&secret).await?;
        let keys = self.key_store.load_or_default(&secret).await?;

        info!(
            profiles = config.profiles.len(),
            credentials = credentials.entries.len(),
            keys = keys.keys.len(),
            "vault unlocked"
        );
        *guard = Some(Unlocked {
            secret,
            config,
            credentials,
            keys,
        });
        Ok(())
    }

    /// Flushes the stores and discards the decrypted working set. The
    /// secret and all plaintext schemas zeroize on drop. Sessions already
    /// open keep running.
    pub async fn lock(&self) -> Result<(), CoreError> {
        let mut guard = self.unlocked.write().await;
        let Some(unlocked) = guard.as_ref() else {
            return Ok(());
        };
        self.flush(unlocked).await?;
        *guard = None;
        info!("vault locked");
        Ok(())
    }

    /// Verifies the old password, derives a fresh secret under a new salt
    /// and re-encrypts all three stores under it. A snapshot is taken
    /// first: between the auth-file rewrite and the store re-encryption
    /// the on-disk vault is inconsistent, and a crash in that window is
    /// recoverable only from the snapshot.
    pub async fn change_master_password(&self, old: &str, new: &str) -> Result<(), CoreError> {
        let mut guard = self.unlocked.write().await;
        let unlocked = guard.as_mut().ok_or(CoreError::Locked)?;

        // Verify the old password before the vault files are touched, so a
        // failed attempt leaves no snapshot behind either.
        drop(self.kdf.initialize_or_unlock(old)?);

        // Flush under the old secret first so the snapshot captures every
        // store, then snapshot the consistent vault.
        self.flush(unlocked).await?;
        let snapshot = self.backup.create_snapshot().await?;

        unlocked.secret = self.kdf.change_password(old, new)?;
        self.flush(unlocked).await?;
        info!(
            recovery_seq = snapshot.seq,
            "stores re-encrypted under new master password"
        );
        Ok(())
    }

    /// Persists all three stores under the current secret.
    pub async fn save_all(&self) -> Result<(), CoreError> {
        let guard = self.unlocked.read().await;
        let unlocked = guard.as_ref().ok_or(CoreError::Locked)?;
        self.flush(unlocked).await
    }

    async fn flush(&self, unlocked: &Unlocked) -> Result<(), CoreError> {
        self.config_store
            .save(&unlocked.secret, &unlocked.config)
            .await?;
        self.credential_store
            .save(&unlocked.secret, &unlocked.credentials)
            .await?;
        self.key_store.save(&unlocked.secret, &unlocked.keys).await?;
        Ok(())
    }

    // --- profile management ---

    pub async fn profiles(&self) -> Result<Vec<ConnectionProfile>, CoreError> {
        let guard = self.unlocked.read().await;
        let unlocked = guard.as_ref().ok_or(CoreError::Locked)?;
        Ok(unlocked.config.profiles.clone())
    }

    pub async fn add_profile(&self, profile: ConnectionProfile) -> Result<(), CoreError> {
        self.with_config(|config| config.add_profile(profile)).await
    }

    pub async fn remove_profile(&self, id: &str) -> Result<(), CoreError> {
        let id = id.to_string();
        self.with_config(move |config| {
            config.remove_profile(&id);
        })
        .await
    }

    async fn with_config(
        &self,
        mutate: impl FnOnce(&mut VaultConfig),
    ) -> Result<(), CoreError> {
        let mut guard = self.unlocked.write().await;
        let unlocked = guard.as_mut().ok_or(CoreError::Locked)?;
        mutate(&mut unlocked.config);
        self.config_store
            .save(&unlocked.secret, &unlocked.config)
            .await?;
        Ok(())
    }

    // --- credential and key material management ---

    pub async fn add_credential(&self, entry: CredentialEntry) -> Result<(), CoreError> {
        let mut guard = self.unlocked.write().await;
        let unlocked = guard.as_mut().ok_or(CoreError::Locked)?;
        unlocked.credentials.add(entry);
        self.credential_store
            .save(&unlocked.secret, &unlocked.credentials)
            .await?;
        Ok(())
    }

    pub async fn remove_credential(&self, id: &str) -> Result<bool, CoreError> {
        let mut guard = self.unlocked.write().await;
        let unlocked = guard.as_mut().ok_or(CoreError::Locked)?;
        let removed = unlocked.credentials.remove(id);
        if removed {
            self.credential_store
                .save(&unlocked.secret, &unlocked.credentials)
                .await?;
        }
        Ok(removed)
    }

    /// Minimum-lifetime copy of a credential secret; the copy zeroizes
    /// itself when dropped.
    pub async fn credential_secret(&self, id: &str) -> Result<Option<Zeroizing<String>>, CoreError> {
        let guard = self.unlocked.read().await;
        let unlocked = guard.as_ref().ok_or(CoreError::Locked)?;
        Ok(unlocked.credentials.secret_of(id))
    }

    pub async fn add_key(&self, key: KeyEntry) -> Result<(), CoreError> {
        let mut guard = self.unlocked.write().await;
        let unlocked = guard.as_mut().ok_or(CoreError::Locked)?;
        unlocked.keys.add(key);
        self.key_store.save(&unlocked.secret, &unlocked.keys).await?;
        Ok(())
    }

    pub async fn private_key(&self, id: &str) -> Result<Option<Zeroizing<String>>, CoreError> {
        let guard = self.unlocked.read().await;
        let unlocked = guard.as_ref().ok_or(CoreError::Locked)?;
        Ok(unlocked.keys.private_key_of(id))
    }

    // --- sessions ---

    /// Opens a session for a saved profile. The profile is marked recently
    /// used and the configuration store is flushed before the connect
    /// proceeds in the background.
    pub async fn open_session(&self, profile_id: &str) -> Result<SessionHandle, CoreError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoreError::ShuttingDown);
        }

        let endpoint = {
            let mut guard = self.unlocked.write().await;
            let unlocked = guard.as_mut().ok_or(CoreError::Locked)?;
            let profile = unlocked
                .config
                .get_profile(profile_id)
                .ok_or_else(|| CoreError::ProfileNotFound(profile_id.to_string()))?;
            let endpoint = Endpoint::new(profile.host.clone(), profile.port, &profile.username);

            unlocked.config.mark_used(profile_id);
            self.config_store
                .save(&unlocked.secret, &unlocked.config)
                .await?;
            endpoint
        };

        Ok(self.sessions.open(endpoint))
    }

    /// Restores snapshot `seq` over the live vault files, then locks: the
    /// restored auth file may belong to a different master password, so the
    /// in-memory working set is no longer trustworthy.
    pub async fn restore_backup(&self, seq: u64) -> Result<(), CoreError> {
        self.backup.restore_snapshot(seq).await?;
        let mut guard = self.unlocked.write().await;
        if guard.take().is_some() {
            warn!("vault locked after restore, unlock again to continue");
        }
        Ok(())
    }

    pub async fn create_backup(&self) -> Result<BackupSnapshot, CoreError> {
        Ok(self.backup.create_snapshot().await?)
    }

    /// Ordered teardown: stop scheduled backups, close every session within
    /// the configured bound, flush and lock the vault. Idempotent; a second
    /// call reports `ShuttingDown`.
    pub async fn shutdown(&self) -> Result<ShutdownReport, CoreError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(CoreError::ShuttingDown);
        }
        info!("shutdown started");

        if let Some(task) = &self.backup_task {
            task.abort();
        }

        let sessions = self
            .sessions
            .close_all(self.settings.session_close_timeout())
            .await;

        // Save failures are reported but never keep the process from
        // exiting; the secret is discarded either way.
        let mut guard = self.unlocked.write().await;
        let flushed = match guard.take() {
            Some(unlocked) => match self.flush(&unlocked).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("failed to flush vault stores at shutdown: {}", e);
                    false
                }
            },
            None => false,
        };
        if let Err(e) = self.settings_store.save(&self.settings) {
            warn!("failed to save settings at shutdown: {}", e);
        }

        info!(
            closed = sessions.closed,
            stragglers = sessions.stragglers.len(),
            flushed,
            "shutdown complete"
        );
        Ok(ShutdownReport { sessions, flushed })
    }
}
