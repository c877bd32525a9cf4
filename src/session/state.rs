//! Session State Machine
//!
//! Valid lifecycle transitions for a remote session:
//!
//! ```text
//! ┌─────────┐   spawn    ┌────────────┐  connect ok  ┌────────┐
//! │ Created │ ─────────► │ Connecting │ ───────────► │ Active │
//! └─────────┘            └─────┬──────┘              └───┬────┘
//!                              │                         │
//!                 error/timeout│      ┌──────────────────┤ close
//!                              ▼      ▼ transport error  ▼
//!                         ┌────────┐             ┌─────────┐
//!                         │ Failed │             │ Closing │
//!                         └────────┘             └────┬────┘
//!                                                     ▼
//!                                                ┌────────┐
//!                                                │ Closed │
//!                                                └────────┘
//! ```
//!
//! `Closed` and `Failed` are terminal. A close request during `Connecting`
//! abandons the connection attempt and proceeds through `Closing`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Allocated, task not yet connecting
    #[default]
    Created,
    /// Establishing the transport (handshake + auth)
    Connecting,
    /// Connected and ready for I/O
    Active,
    /// Gracefully releasing the transport
    Closing,
    /// Transport released; terminal
    Closed,
    /// Transport error during connect or while active; terminal
    Failed,
}

impl SessionState {
    /// Whether the session can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether the session is connecting or connected.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

/// Lifecycle driver for one session. The owning session task is the sole
/// writer; observers read the state via the watch channel it is mirrored
/// into.
#[derive(Debug)]
pub struct Lifecycle {
    state: SessionState,
    failure: Option<String>,
    state_changed_at: Instant,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: SessionState::Created,
            failure: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Failure cause, if terminal due to an error.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_changed_at.elapsed()
    }

    /// `Created -> Connecting`
    pub fn begin_connect(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Created => {
                self.transition_to(SessionState::Connecting);
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Connecting)),
        }
    }

    /// `Connecting -> Active`
    pub fn connected(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Connecting => {
                self.transition_to(SessionState::Active);
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Active)),
        }
    }

    /// `Connecting | Active -> Failed` with the recorded cause
    pub fn fail(&mut self, cause: String) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Connecting | SessionState::Active => {
                self.transition_to(SessionState::Failed);
                self.failure = Some(cause);
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Failed)),
        }
    }

    /// `Created | Connecting | Active -> Closing`
    pub fn begin_close(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Created | SessionState::Connecting | SessionState::Active => {
                self.transition_to(SessionState::Closing);
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Closing)),
        }
    }

    /// `Closing -> Closed`
    pub fn closed(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            SessionState::Closing => {
                self.transition_to(SessionState::Closed);
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Closed)),
        }
    }

    fn invalid(&self, to: SessionState) -> StateTransitionError {
        StateTransitionError::InvalidTransition {
            from: self.state,
            to,
        }
    }

    fn transition_to(&mut self, new_state: SessionState) {
        tracing::debug!("session state transition: {} -> {}", self.state, new_state);
        self.state = new_state;
        self.state_changed_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.state(), SessionState::Created);

        lc.begin_connect().unwrap();
        assert_eq!(lc.state(), SessionState::Connecting);

        lc.connected().unwrap();
        assert_eq!(lc.state(), SessionState::Active);

        lc.begin_close().unwrap();
        assert_eq!(lc.state(), SessionState::Closing);

        lc.closed().unwrap();
        assert_eq!(lc.state(), SessionState::Closed);
        assert!(lc.state().is_terminal());
    }

    #[test]
    fn connect_failure_records_cause() {
        let mut lc = Lifecycle::new();
        lc.begin_connect().unwrap();
        lc.fail("connection refused".to_string()).unwrap();

        assert_eq!(lc.state(), SessionState::Failed);
        assert_eq!(lc.failure(), Some("connection refused"));
    }

    #[test]
    fn failure_while_active() {
        let mut lc = Lifecycle::new();
        lc.begin_connect().unwrap();
        lc.connected().unwrap();
        lc.fail("broken pipe".to_string()).unwrap();
        assert!(lc.state().is_terminal());
    }

    #[test]
    fn close_during_connecting() {
        let mut lc = Lifecycle::new();
        lc.begin_connect().unwrap();
        lc.begin_close().unwrap();
        lc.closed().unwrap();
        assert_eq!(lc.state(), SessionState::Closed);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut lc = Lifecycle::new();
        // Cannot go straight to Active or Closed.
        assert!(lc.connected().is_err());
        assert!(lc.closed().is_err());

        lc.begin_connect().unwrap();
        lc.begin_close().unwrap();
        lc.closed().unwrap();
        // Terminal states accept nothing.
        assert!(lc.begin_close().is_err());
        assert!(lc.fail("late".into()).is_err());
    }
}
