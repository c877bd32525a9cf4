//! Backup Coordinator
//!
//! Snapshots the vault files into numbered directories under `backups/`
//! and rotates old snapshots per the retention policy. Snapshot and
//! restore hold the file-set lock exclusively, so they never run
//! concurrently with each other or with store saves. Snapshots copy
//! ciphertext bytes and therefore work whether or not the vault is
//! unlocked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::vault::kdf::AUTH_FILE;
use crate::vault::stores::{CONFIG_FILE, CREDENTIALS_FILE, KEYS_FILE};

/// Subdirectory of the vault directory holding snapshots
pub const BACKUP_SUBDIR: &str = "backups";

const SNAPSHOT_PREFIX: &str = "snapshot-";

/// Files included in every snapshot. settings.json is deliberately
/// excluded: it carries the retention policy governing this coordinator.
const SNAPSHOT_FILES: [&str; 4] = [AUTH_FILE, CONFIG_FILE, CREDENTIALS_FILE, KEYS_FILE];

/// When snapshots are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTrigger {
    OnDemand,
    Interval(Duration),
}

/// Snapshot retention policy, supplied by the settings store
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Snapshots kept before the oldest is evicted (0 = unlimited)
    pub max_snapshots: usize,
    pub trigger: SnapshotTrigger,
}

/// A completed point-in-time copy of the vault files
#[derive(Debug, Clone)]
pub struct BackupSnapshot {
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub files: Vec<String>,
}

/// Backup errors
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot {0} not found")]
    NotFound(u64),

    #[error("snapshot {0} contains no vault files")]
    Empty(u64),
}

/// Serializes snapshot/restore against each other and against store saves.
pub struct BackupCoordinator {
    vault_dir: PathBuf,
    backup_dir: PathBuf,
    policy: RetentionPolicy,
    file_lock: Arc<RwLock<()>>,
}

impl BackupCoordinator {
    /// `file_lock` must be the same lock the encrypted stores hold shared
    /// during saves.
    pub fn new(vault_dir: &Path, policy: RetentionPolicy, file_lock: Arc<RwLock<()>>) -> Self {
        Self {
            vault_dir: vault_dir.to_path_buf(),
            backup_dir: vault_dir.join(BACKUP_SUBDIR),
            policy,
            file_lock,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Copies the current bytes of every vault file into a new snapshot
    /// directory, then enforces retention.
    pub async fn create_snapshot(&self) -> Result<BackupSnapshot, BackupError> {
        // Exclusive: no saves, no other snapshot/restore while copying.
        let _guard = self.file_lock.write().await;

        let vault_dir = self.vault_dir.clone();
        let backup_dir = self.backup_dir.clone();
        let max = self.policy.max_snapshots;
        tokio::task::spawn_blocking(move || snapshot_blocking(&vault_dir, &backup_dir, max))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(format!("task join error: {}", e))))?
    }

    /// Restores every file of snapshot `seq` into the vault directory, all
    /// together or not at all: files are staged next to their targets and
    /// only renamed into place after every copy succeeded.
    pub async fn restore_snapshot(&self, seq: u64) -> Result<(), BackupError> {
        let _guard = self.file_lock.write().await;

        let vault_dir = self.vault_dir.clone();
        let backup_dir = self.backup_dir.clone();
        tokio::task::spawn_blocking(move || restore_blocking(&vault_dir, &backup_dir, seq))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(format!("task join error: {}", e))))?
    }

    /// Existing snapshot sequence numbers, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<u64>, BackupError> {
        Ok(list_sequences(&self.backup_dir)?)
    }

    /// Spawns the scheduled-snapshot task when the policy asks for one.
    pub fn spawn_interval_task(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let SnapshotTrigger::Interval(period) = self.policy.trigger else {
            return None;
        };
        let coordinator = Arc::clone(self);
        info!(interval_secs = period.as_secs(), "scheduled backups enabled");
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // snapshot lands one full period after startup.
            tick.tick().await;
            loop {
                tick.tick().await;
                match coordinator.create_snapshot().await {
                    Ok(snapshot) => {
                        debug!(seq = snapshot.seq, "scheduled snapshot created")
                    }
                    Err(e) => warn!("scheduled snapshot failed: {}", e),
                }
            }
        }))
    }
}

fn snapshot_dir_name(seq: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{seq:06}")
}

fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(SNAPSHOT_PREFIX)?.parse().ok()
}

fn list_sequences(backup_dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut seqs = Vec::new();
    let entries = match std::fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seqs),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_sequence) {
            if entry.file_type()?.is_dir() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

fn snapshot_blocking(
    vault_dir: &Path,
    backup_dir: &Path,
    max_snapshots: usize,
) -> Result<BackupSnapshot, BackupError> {
    std::fs::create_dir_all(backup_dir)?;

    let seq = list_sequences(backup_dir)?.last().map_or(1, |last| last + 1);

    // Stage into a hidden directory, rename once complete. A crash leaves
    // a stale staging dir that the next snapshot overwrites, never a
    // half-visible snapshot.
    let staging = backup_dir.join(format!(".staging-{seq:06}"));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let mut files = Vec::new();
    for name in SNAPSHOT_FILES {
        let src = vault_dir.join(name);
        if src.exists() {
            std::fs::copy(&src, staging.join(name))?;
            files.push(name.to_string());
        }
    }

    let path = backup_dir.join(snapshot_dir_name(seq));
    std::fs::rename(&staging, &path)?;

    let snapshot = BackupSnapshot {
        seq,
        created_at: Utc::now(),
        path,
        files,
    };
    info!(seq, files = snapshot.files.len(), "snapshot created");

    enforce_retention(backup_dir, max_snapshots)?;
    Ok(snapshot)
}

fn enforce_retention(backup_dir: &Path, max_snapshots: usize) -> Result<(), BackupError> {
    if max_snapshots == 0 {
        debug!("unlimited snapshot retention, skipping cleanup");
        return Ok(());
    }

    let seqs = list_sequences(backup_dir)?;
    if seqs.len() <= max_snapshots {
        return Ok(());
    }

    let excess = seqs.len() - max_snapshots;
    info!(count = excess, max = max_snapshots, "evicting old snapshots");
    for &seq in &seqs[..excess] {
        let dir = backup_dir.join(snapshot_dir_name(seq));
        std::fs::remove_dir_all(&dir)?;
        debug!(seq, "snapshot evicted");
    }
    Ok(())
}

fn restore_blocking(vault_dir: &Path, backup_dir: &Path, seq: u64) -> Result<(), BackupError> {
    let snapshot_dir = backup_dir.join(snapshot_dir_name(seq));
    if !snapshot_dir.is_dir() {
        return Err(BackupError::NotFound(seq));
    }

    // Anything present under a snapshot file name belongs to the restore
    // set; an entry that is not a copyable regular file must abort the
    // whole restore, not shrink it.
    let present: Vec<&str> = SNAPSHOT_FILES
        .iter()
        .copied()
        .filter(|name| snapshot_dir.join(name).exists())
        .collect();
    if present.is_empty() {
        return Err(BackupError::Empty(seq));
    }

    // Stage every file first; commit only after all copies succeeded.
    let mut staged = Vec::new();
    for name in &present {
        let tmp = vault_dir.join(format!("{name}.restore"));
        match std::fs::copy(snapshot_dir.join(name), &tmp) {
            Ok(_) => staged.push((tmp, vault_dir.join(name))),
            Err(e) => {
                for (tmp, _) in staged {
                    let _ = std::fs::remove_file(tmp);
                }
                return Err(e.into());
            }
        }
    }
    for (tmp, target) in staged {
        std::fs::rename(tmp, target)?;
    }

    info!(seq, files = present.len(), "snapshot restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(max: usize) -> RetentionPolicy {
        RetentionPolicy {
            max_snapshots: max,
            trigger: SnapshotTrigger::OnDemand,
        }
    }

    fn seed_vault(dir: &Path) {
        std::fs::write(dir.join(AUTH_FILE), b"auth bytes").unwrap();
        std::fs::write(dir.join(CONFIG_FILE), b"config bytes").unwrap();
        std::fs::write(dir.join(CREDENTIALS_FILE), b"credential bytes").unwrap();
    }

    fn coordinator(dir: &Path, max: usize) -> BackupCoordinator {
        BackupCoordinator::new(dir, policy(max), Arc::new(RwLock::new(())))
    }

    #[tokio::test]
    async fn snapshot_copies_existing_files() {
        let dir = TempDir::new().unwrap();
        seed_vault(dir.path());
        let backup = coordinator(dir.path(), 5);

        let snapshot = backup.create_snapshot().await.unwrap();
        assert_eq!(snapshot.seq, 1);
        // keys.vault does not exist yet and is skipped
        assert_eq!(snapshot.files.len(), 3);
        assert_eq!(
            std::fs::read(snapshot.path.join(CONFIG_FILE)).unwrap(),
            b"config bytes"
        );
    }

    #[tokio::test]
    async fn retention_keeps_most_recent_n() {
        let dir = TempDir::new().unwrap();
        seed_vault(dir.path());
        let backup = coordinator(dir.path(), 3);

        for _ in 0..5 {
            backup.create_snapshot().await.unwrap();
        }

        let seqs = backup.list_snapshots().unwrap();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn sequence_is_monotonic_across_eviction() {
        let dir = TempDir::new().unwrap();
        seed_vault(dir.path());
        let backup = coordinator(dir.path(), 2);

        for _ in 0..4 {
            backup.create_snapshot().await.unwrap();
        }
        let next = backup.create_snapshot().await.unwrap();
        assert_eq!(next.seq, 5);
    }

    #[tokio::test]
    async fn restore_round_trip() {
        let dir = TempDir::new().unwrap();
        seed_vault(dir.path());
        let backup = coordinator(dir.path(), 5);
        let snapshot = backup.create_snapshot().await.unwrap();

        std::fs::write(dir.path().join(CONFIG_FILE), b"mutated").unwrap();
        backup.restore_snapshot(snapshot.seq).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join(CONFIG_FILE)).unwrap(),
            b"config bytes"
        );
    }

    #[tokio::test]
    async fn restore_unknown_sequence() {
        let dir = TempDir::new().unwrap();
        let backup = coordinator(dir.path(), 5);
        assert!(matches!(
            backup.restore_snapshot(42).await.unwrap_err(),
            BackupError::NotFound(42)
        ));
    }

    #[tokio::test]
    async fn restore_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        seed_vault(dir.path());
        let backup = coordinator(dir.path(), 5);
        let snapshot = backup.create_snapshot().await.unwrap();

        // Mutate the live files, then sabotage one snapshot file so its
        // copy fails: no live file may change.
        std::fs::write(dir.path().join(AUTH_FILE), b"live auth").unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), b"live config").unwrap();
        let sabotage = snapshot.path.join(CREDENTIALS_FILE);
        std::fs::remove_file(&sabotage).unwrap();
        std::fs::create_dir(&sabotage).unwrap();

        assert!(backup.restore_snapshot(snapshot.seq).await.is_err());
        assert_eq!(
            std::fs::read(dir.path().join(AUTH_FILE)).unwrap(),
            b"live auth"
        );
        assert_eq!(
            std::fs::read(dir.path().join(CONFIG_FILE)).unwrap(),
            b"live config"
        );
        // No staging residue either.
        assert!(!dir.path().join(format!("{AUTH_FILE}.restore")).exists());
    }

    #[tokio::test]
    async fn scheduled_snapshots_fire() {
        let dir = TempDir::new().unwrap();
        seed_vault(dir.path());
        let backup = Arc::new(BackupCoordinator::new(
            dir.path(),
            RetentionPolicy {
                max_snapshots: 5,
                trigger: SnapshotTrigger::Interval(Duration::from_millis(20)),
            },
            Arc::new(RwLock::new(())),
        ));

        let task = backup.spawn_interval_task().unwrap();
        tokio::time::sleep(Duration::from_millis(90)).await;
        task.abort();

        assert!(!backup.list_snapshots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_demand_policy_spawns_no_task() {
        let dir = TempDir::new().unwrap();
        let backup = Arc::new(coordinator(dir.path(), 5));
        assert!(backup.spawn_interval_task().is_none());
    }
}
