//! Peer Management
//!
//! Every accepted connection is a [`Session`]. Sessions move through three
//! stages:
//! 1. **Anonymous** - registered by internal ID only
//! 2. **Identified** - an identity ID was attached during the handshake
//! 3. **Exclusive owner** - the single session acting online for that identity
//!
//! The [`PeerRegistry`] indexes live sessions by all three. It holds shared
//! handles; the session loop owns the socket.

mod registry;
mod session;

pub use registry::{PeerRegistry, PromotionResult};
pub use session::{ConversationState, ConversationStatus, Session, SessionWriter};

use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Registry consistency violations.
///
/// These indicate a race between a session's own cleanup and another task
/// acting on it. They are logged and degrade to a no-op.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0:#x} already registered")]
    DuplicateId(u64),

    #[error("session {0:#x} not registered")]
    NotRegistered(u64),

    #[error("session {0:#x} has no identity")]
    NoIdentity(u64),
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
