//! Role Servers
//!
//! A role server owns one TCP listener serving one or more roles. Accepted
//! sockets flow through three stages, none of which blocks the one before:
//!
//! 1. **Accept loop** - pushes sockets onto a bounded dispatch queue
//! 2. **Dispatch loop** - allocates a [`Session`](crate::peer::Session),
//!    registers it and spawns its session loop
//! 3. **Session loop** - one per connection: read frame, handle, reply
//!
//! The [`ServerManager`] owns all role servers, the shared
//! [`PeerRegistry`](crate::peer::PeerRegistry) and the idle sweep.

mod conversation;
mod handler;
mod manager;
mod role;
mod session_loop;
mod tls;

pub use conversation::ConversationHandler;
pub use handler::{HandlerContext, HandlerFactory, HandlerOutcome, MessageHandler};
pub use manager::{sweep_idle_connections, ServerManager};
pub use role::{RoleServer, RoleServerContext};
pub use session_loop::SessionExit;
pub use tls::load_tls_acceptor;

use crate::config::ConfigError;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// How long `stop` waits for each loop before giving up on it.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Errors
// ============================================================================

/// Errors related to role server operation.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("failed to bind {addr} after {attempts} attempts: {source}")]
    BindFailed {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("encrypted role server on port {0} has no tls acceptor")]
    TlsNotConfigured(u16),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a role server listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RoleServerState {
    /// Not listening.
    #[default]
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Shutting down loops.
    Stopping,
}

impl RoleServerState {
    /// Check if server can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, RoleServerState::Stopped)
    }

    /// Check if server can be stopped.
    pub fn can_stop(&self) -> bool {
        matches!(self, RoleServerState::Running)
    }
}

impl fmt::Display for RoleServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoleServerState::Stopped => "stopped",
            RoleServerState::Starting => "starting",
            RoleServerState::Running => "running",
            RoleServerState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Resolve once the shutdown flag is set or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
