//! Ferroterm core: vault, settings, backup and session lifecycle for the
//! desktop terminal client.
//!
//! Everything secret lives behind the vault: a master password is stretched
//! with Argon2id into a symmetric secret that encrypts the connection
//! profiles, credentials and key material at rest. Sessions are tracked by
//! a registry that drives each one from its own task and tears all of them
//! down in bounded time at shutdown. [`app::TerminalCore`] is the façade
//! the UI layer talks to.

pub mod app;
pub mod backup;
pub mod session;
pub mod settings;
pub mod vault;

pub use app::{default_vault_dir, CoreError, ShutdownReport, TerminalCore};
pub use backup::{BackupCoordinator, BackupError, BackupSnapshot, RetentionPolicy, SnapshotTrigger};
pub use session::{
    CloseAllReport, Endpoint, SessionHandle, SessionRegistry, SessionState, TcpConnector,
};
pub use settings::{Settings, SettingsStore};
pub use vault::kdf::{AuthError, KdfService, MasterSecret};
pub use vault::store::VaultError;
pub use vault::stores::{ConfigurationStore, CredentialStore, KeyMaterialStore};

use tracing_subscriber::EnvFilter;

/// Initializes the tracing subscriber. `RUST_LOG` overrides the default
/// `info` level. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
