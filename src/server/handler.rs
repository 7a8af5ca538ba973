//! The seam between the session loop and business logic.

use crate::peer::{PeerRegistry, Session};
use crate::protocol::{Message, RoleSet};
use async_trait::async_trait;
use std::sync::Arc;

/// What the session loop should do after a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Response to write back, if any.
    pub response: Option<Message>,
    /// Keep reading from the connection.
    pub keep_open: bool,
}

impl HandlerOutcome {
    /// Reply and continue.
    pub fn reply(response: Message) -> Self {
        Self {
            response: Some(response),
            keep_open: true,
        }
    }

    /// Reply, then close the connection.
    pub fn reply_and_close(response: Message) -> Self {
        Self {
            response: Some(response),
            keep_open: false,
        }
    }

    /// Continue without replying.
    pub fn silent() -> Self {
        Self {
            response: None,
            keep_open: true,
        }
    }

    /// Close without replying.
    pub fn close() -> Self {
        Self {
            response: None,
            keep_open: false,
        }
    }
}

/// Per-connection business logic.
///
/// One handler is created per session and called sequentially, in arrival
/// order, from that session's loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message.
    async fn process_message(&self, session: &Arc<Session>, message: Message) -> HandlerOutcome;

    /// Response sent once when the peer's input cannot be decoded, just
    /// before the connection is closed. `None` closes silently.
    fn protocol_violation(&self) -> Option<Message> {
        None
    }

    /// Called exactly once after the session left the registry.
    async fn on_disconnect(&self, _session: &Arc<Session>) {}
}

/// What a handler factory gets to know about a new session.
#[derive(Clone)]
pub struct HandlerContext {
    pub session: Arc<Session>,
    /// Roles of the server that accepted the session.
    pub roles: RoleSet,
    pub registry: Arc<PeerRegistry>,
}

/// Creates the handler for each accepted session.
pub type HandlerFactory = Arc<dyn Fn(HandlerContext) -> Box<dyn MessageHandler> + Send + Sync>;
