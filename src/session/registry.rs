//! Session Registry
//!
//! Tracks every live remote session. Each `open` spawns a dedicated task
//! that owns the transport exclusively and is the sole writer of the
//! session's lifecycle state; the state value is mirrored into a watch
//! channel so monitoring reads never block session progress. `close_all`
//! drives ordered teardown at shutdown with a bounded wait and reports
//! stragglers instead of hanging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{Lifecycle, SessionState};
use super::transport::{Endpoint, Transport, TransportConnector, TransportError};

/// Session errors. Failures are recorded per session and never abort
/// sibling sessions or the registry.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Commands delivered to a session task
enum SessionCommand {
    /// Graceful close requested by the user or shutdown
    Close,
    /// Transport error reported by the I/O layer above
    Fail(String),
}

struct SessionEntry {
    id: String,
    endpoint: Endpoint,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    state_rx: watch::Receiver<SessionState>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    failure: RwLock<Option<String>>,
}

impl SessionEntry {
    fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }
}

/// Handle returned by `open`. Allocation is immediate; connection progress
/// is observable through the lifecycle state.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Current lifecycle state (non-blocking read).
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Waits until the state satisfies the predicate and returns it.
    /// Returns the last observed state if the session task is gone.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(SessionState) -> bool,
    ) -> SessionState {
        match self.state_rx.wait_for(|s| predicate(*s)).await.map(|s| *s) {
            Ok(state) => state,
            Err(_) => *self.state_rx.borrow(),
        }
    }

    /// Waits until the session reaches `Closed` or `Failed`.
    pub async fn wait_terminal(&mut self) -> SessionState {
        self.wait_for(|s| s.is_terminal()).await
    }
}

/// Per-session metadata for monitoring. Never carries credentials or key
/// material.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub endpoint: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Aggregate registry state for external monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub total: usize,
    pub created: usize,
    pub connecting: usize,
    pub active: usize,
    pub closing: usize,
    pub closed: usize,
    pub failed: usize,
    pub sessions: Vec<SessionInfo>,
}

/// Outcome of `close_all`
#[derive(Debug, Clone, Default)]
pub struct CloseAllReport {
    pub closed: usize,
    pub failed: usize,
    /// Sessions that did not reach a terminal state within the bound
    pub stragglers: Vec<String>,
}

impl CloseAllReport {
    pub fn all_terminated(&self) -> bool {
        self.stragglers.is_empty()
    }
}

/// Tracks and tears down live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    connector: Arc<dyn TransportConnector>,
    connect_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn TransportConnector>, connect_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            connector,
            connect_timeout,
        }
    }

    /// Allocates a session and returns its handle immediately; the connect
    /// proceeds in the session task.
    pub fn open(&self, endpoint: Endpoint) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);

        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            endpoint,
            created_at: Utc::now(),
            last_activity: RwLock::new(Utc::now()),
            state_rx: state_rx.clone(),
            cmd_tx,
            failure: RwLock::new(None),
        });
        self.sessions.insert(id.clone(), Arc::clone(&entry));
        info!(session = %id, endpoint = %entry.endpoint, "session opened");

        let connector = Arc::clone(&self.connector);
        let connect_timeout = self.connect_timeout;
        tokio::spawn(run_session(entry, state_tx, cmd_rx, connector, connect_timeout));

        SessionHandle { id, state_rx }
    }

    /// Requests a graceful close. Idempotent: closing an already terminal
    /// session is a no-op success. Does not block; completion is
    /// observable via the lifecycle state.
    pub fn close(&self, id: &str) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if entry.state().is_terminal() {
            return Ok(());
        }
        // A full or closed queue means the task is already tearing down.
        let _ = entry.cmd_tx.try_send(SessionCommand::Close);
        Ok(())
    }

    /// Reports a transport error observed by the I/O layer; the session
    /// moves to `Failed` and releases its transport.
    pub fn report_failure(&self, id: &str, cause: impl Into<String>) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if entry.state().is_terminal() {
            return Ok(());
        }
        let _ = entry.cmd_tx.try_send(SessionCommand::Fail(cause.into()));
        Ok(())
    }

    /// Updates the last-activity timestamp for a session.
    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.sessions.get(id) {
            *entry.last_activity.write() = Utc::now();
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Live (connecting or active) session count.
    pub fn live_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.state().is_live())
            .count()
    }

    /// Read-only aggregate view for monitoring. Exposes endpoints and
    /// lifecycle metadata only, never secrets.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();
        for entry in self.sessions.iter() {
            let state = entry.state();
            match state {
                SessionState::Created => snapshot.created += 1,
                SessionState::Connecting => snapshot.connecting += 1,
                SessionState::Active => snapshot.active += 1,
                SessionState::Closing => snapshot.closing += 1,
                SessionState::Closed => snapshot.closed += 1,
                SessionState::Failed => snapshot.failed += 1,
            }
            snapshot.sessions.push(SessionInfo {
                id: entry.id.clone(),
                endpoint: entry.endpoint.to_string(),
                state,
                created_at: entry.created_at,
                last_activity: *entry.last_activity.read(),
                failure: entry.failure.read().clone(),
            });
        }
        snapshot.total = snapshot.sessions.len();
        snapshot
    }

    /// Removes terminal sessions from the registry and returns how many
    /// were pruned.
    pub fn prune_terminal(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| !entry.state().is_terminal());
        before - self.sessions.len()
    }

    /// Concurrently requests close on every tracked session and waits for
    /// all of them to reach a terminal state, up to `bound`. Sessions that
    /// did not terminate in time are reported, not waited on forever.
    /// Idempotent: a second call finds only terminal sessions.
    pub async fn close_all(&self, bound: Duration) -> CloseAllReport {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();

        for entry in &entries {
            if !entry.state().is_terminal() {
                let _ = entry.cmd_tx.try_send(SessionCommand::Close);
            }
        }

        let deadline = Instant::now() + bound;
        let mut report = CloseAllReport::default();
        for entry in entries {
            let mut rx = entry.state_rx.clone();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome =
                tokio::time::timeout(remaining, rx.wait_for(|s| s.is_terminal())).await;
            match outcome {
                Ok(Ok(state)) => match *state {
                    SessionState::Failed => report.failed += 1,
                    _ => report.closed += 1,
                },
                // Channel gone: the task exited, last value is terminal.
                Ok(Err(_)) if entry.state().is_terminal() => report.closed += 1,
                _ => {
                    warn!(session = %entry.id, "session did not terminate within bound");
                    report.stragglers.push(entry.id.clone());
                }
            }
        }

        info!(
            closed = report.closed,
            failed = report.failed,
            stragglers = report.stragglers.len(),
            "close_all complete"
        );
        report
    }
}

/// Session task: sole owner of the transport, sole writer of the state.
async fn run_session(
    entry: Arc<SessionEntry>,
    state_tx: watch::Sender<SessionState>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    connector: Arc<dyn TransportConnector>,
    connect_timeout: Duration,
) {
    let mut lifecycle = Lifecycle::new();
    advance(&entry, &state_tx, &mut lifecycle, Lifecycle::begin_connect);

    let endpoint = entry.endpoint.clone();
    let connect = tokio::time::timeout(connect_timeout, connector.connect(&endpoint));

    let mut transport: Box<dyn Transport> = tokio::select! {
        result = connect => match result {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                fail_session(&entry, &state_tx, &mut lifecycle, e.to_string());
                return;
            }
            Err(_) => {
                fail_session(
                    &entry,
                    &state_tx,
                    &mut lifecycle,
                    format!("connect timed out after {:?}", connect_timeout),
                );
                return;
            }
        },
        cmd = cmd_rx.recv() => {
            // Close/fail requested before the connect finished; the
            // abandoned connect future drops the attempt.
            match cmd {
                Some(SessionCommand::Fail(cause)) => {
                    fail_session(&entry, &state_tx, &mut lifecycle, cause);
                }
                Some(SessionCommand::Close) | None => {
                    advance(&entry, &state_tx, &mut lifecycle, Lifecycle::begin_close);
                    advance(&entry, &state_tx, &mut lifecycle, Lifecycle::closed);
                    debug!(session = %entry.id, "closed before connect completed");
                }
            }
            return;
        }
    };

    advance(&entry, &state_tx, &mut lifecycle, Lifecycle::connected);
    info!(session = %entry.id, endpoint = %entry.endpoint, "session active");

    // Active: wait for a close request or a reported transport failure.
    // A dropped registry entry (None) closes gracefully too.
    match cmd_rx.recv().await {
        Some(SessionCommand::Fail(cause)) => {
            warn!(session = %entry.id, cause = %cause, "session transport failed");
            if let Err(e) = transport.close().await {
                debug!(session = %entry.id, "transport release after failure: {}", e);
            }
            fail_session(&entry, &state_tx, &mut lifecycle, cause);
        }
        Some(SessionCommand::Close) | None => {
            advance(&entry, &state_tx, &mut lifecycle, Lifecycle::begin_close);
            if let Err(e) = transport.close().await {
                warn!(session = %entry.id, "error releasing transport: {}", e);
            }
            advance(&entry, &state_tx, &mut lifecycle, Lifecycle::closed);
            info!(session = %entry.id, "session closed");
        }
    }
}

fn advance(
    entry: &SessionEntry,
    state_tx: &watch::Sender<SessionState>,
    lifecycle: &mut Lifecycle,
    step: impl FnOnce(&mut Lifecycle) -> Result<(), super::state::StateTransitionError>,
) {
    if let Err(e) = step(lifecycle) {
        warn!(session = %entry.id, "lifecycle error: {}", e);
        return;
    }
    let _ = state_tx.send(lifecycle.state());
}

fn fail_session(
    entry: &SessionEntry,
    state_tx: &watch::Sender<SessionState>,
    lifecycle: &mut Lifecycle,
    cause: String,
) {
    warn!(session = %entry.id, endpoint = %entry.endpoint, cause = %cause, "session failed");
    *entry.failure.write() = Some(cause.clone());
    advance(entry, state_tx, lifecycle, move |lc| lc.fail(cause));
}
