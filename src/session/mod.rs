//! Session Lifecycle Module
//!
//! Tracks every live remote session, drives its lifecycle state machine
//! from a dedicated task that owns the transport exclusively, and
//! coordinates ordered teardown at shutdown.

pub mod registry;
pub mod state;
pub mod transport;

pub use registry::{
    CloseAllReport, RegistrySnapshot, SessionError, SessionHandle, SessionInfo, SessionRegistry,
};
pub use state::{SessionState, StateTransitionError};
pub use transport::{Endpoint, TcpConnector, Transport, TransportConnector, TransportError};
