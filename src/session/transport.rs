//! Transport seam for remote sessions.
//!
//! The registry never touches sockets directly: it asks a
//! [`TransportConnector`] for a [`Transport`] and hands it to the session
//! task, which owns it exclusively and releases it exactly once. The
//! protocol layer above (shell channel, terminal data) plugs in behind the
//! same seam.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Remote endpoint a session connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 22 {
            write!(f, "{}@{}", self.username, self.host)
        } else {
            write!(f, "{}@{}:{}", self.username, self.host, self.port)
        }
    }
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live connection owned by exactly one session task.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Releases the underlying resource. Called exactly once.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Establishes transports for new sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError>;
}

/// Plain TCP connector; the production protocol stack layers on top of the
/// same seam.
pub struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(TcpTransport {
            stream: Some(stream),
        }))
    }
}

#[derive(Debug)]
struct TcpTransport {
    stream: Option<TcpStream>,
}

#[async_trait]
impl Transport for TcpTransport {
    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Scriptable connector/transport used by the registry and core tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Connector with controllable delay and failure behavior.
    pub struct MockConnector {
        pub connect_delay: Duration,
        pub fail_connect: bool,
        pub close_delay: Duration,
        /// Counts transport releases across all sessions.
        pub closes: Arc<AtomicUsize>,
    }

    impl Default for MockConnector {
        fn default() -> Self {
            Self {
                connect_delay: Duration::from_millis(1),
                fail_connect: false,
                close_delay: Duration::ZERO,
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl TransportConnector for MockConnector {
        async fn connect(
            &self,
            endpoint: &Endpoint,
        ) -> Result<Box<dyn Transport>, TransportError> {
            tokio::time::sleep(self.connect_delay).await;
            if self.fail_connect {
                return Err(TransportError::Connect(format!(
                    "refused by {}",
                    endpoint.host
                )));
            }
            Ok(Box::new(MockTransport {
                close_delay: self.close_delay,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    #[derive(Debug)]
    pub struct MockTransport {
        close_delay: Duration,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn close(&mut self) -> Result<(), TransportError> {
            tokio::time::sleep(self.close_delay).await;
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
