//! Process-wide index of live sessions.

use super::{lock, RegistryError, Session};
use crate::identity::IdentityId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Result of promoting a session to exclusive owner of its identity.
///
/// The newest session always wins. A replaced owner must be force-closed by
/// the caller.
#[derive(Debug, Clone)]
pub enum PromotionResult {
    /// No session held the identity before.
    Promoted,

    /// A previous owner was displaced and its exclusivity flag cleared.
    Replaced {
        /// The session that lost ownership.
        evicted: Arc<Session>,
    },

    /// The session is not usable for promotion (not registered or no
    /// identity). Nothing changed.
    Rejected(RegistryError),
}

impl PromotionResult {
    /// Check if the session now owns its identity.
    pub fn is_owner(&self) -> bool {
        !matches!(self, PromotionResult::Rejected(_))
    }

    /// The session that must be closed, if any.
    pub fn evicted(&self) -> Option<&Arc<Session>> {
        match self {
            PromotionResult::Replaced { evicted } => Some(evicted),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Indices {
    by_internal_id: HashMap<u64, Arc<Session>>,
    by_identity_id: HashMap<IdentityId, Vec<Arc<Session>>>,
    exclusive_owners: HashMap<IdentityId, Arc<Session>>,
}

/// Index of all live sessions, shared by every role server.
///
/// All three indices sit behind one mutex. No operation performs I/O while
/// holding it; callers close evicted sessions after the call returns.
pub struct PeerRegistry {
    next_internal_id: AtomicU64,
    indices: Mutex<Indices>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            next_internal_id: AtomicU64::new(0),
            indices: Mutex::new(Indices::default()),
        }
    }

    /// Allocate a process-unique session ID.
    pub fn next_internal_id(&self) -> u64 {
        self.next_internal_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a newly accepted session.
    pub fn add_peer(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let id = session.internal_id();
        let mut indices = lock(&self.indices);
        if indices.by_internal_id.contains_key(&id) {
            let err = RegistryError::DuplicateId(id);
            error!(error = %err, "Registry inconsistency");
            return Err(err);
        }
        debug!(session = %session, total = indices.by_internal_id.len() + 1, "Session registered");
        indices.by_internal_id.insert(id, session);
        Ok(())
    }

    /// Index a registered session under the identity it presented.
    ///
    /// Returns false if the session is not registered or has no identity.
    pub fn attach_identity(&self, session: &Arc<Session>) -> bool {
        match self.try_attach_identity(session) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "Failed to attach identity");
                false
            }
        }
    }

    fn try_attach_identity(&self, session: &Arc<Session>) -> Result<(), RegistryError> {
        let id = session.internal_id();
        let identity_id = session.identity_id().ok_or(RegistryError::NoIdentity(id))?;

        let mut indices = lock(&self.indices);
        if !indices.by_internal_id.contains_key(&id) {
            return Err(RegistryError::NotRegistered(id));
        }
        let sessions = indices.by_identity_id.entry(identity_id).or_default();
        if !sessions.iter().any(|s| Arc::ptr_eq(s, session)) {
            sessions.push(session.clone());
        }
        Ok(())
    }

    /// Make a session the single online owner of its identity.
    pub fn promote_to_exclusive_owner(&self, session: &Arc<Session>) -> PromotionResult {
        let id = session.internal_id();
        let Some(identity_id) = session.identity_id() else {
            let err = RegistryError::NoIdentity(id);
            error!(error = %err, "Promotion rejected");
            return PromotionResult::Rejected(err);
        };

        let mut indices = lock(&self.indices);
        if !indices.by_internal_id.contains_key(&id) {
            let err = RegistryError::NotRegistered(id);
            error!(error = %err, "Promotion rejected");
            return PromotionResult::Rejected(err);
        }

        let previous = indices.exclusive_owners.insert(identity_id, session.clone());
        session.set_exclusive_owner(true);

        match previous {
            Some(evicted) if !Arc::ptr_eq(&evicted, session) => {
                evicted.set_exclusive_owner(false);
                debug!(
                    identity = %identity_id,
                    owner = %session,
                    evicted = %evicted,
                    "Exclusive owner replaced"
                );
                PromotionResult::Replaced { evicted }
            }
            _ => PromotionResult::Promoted,
        }
    }

    /// Remove a session from every index.
    ///
    /// The exclusive-owner entry is only removed while this session's flag is
    /// still set, so a newer owner of the same identity is never dropped.
    /// Returns false if the session was not registered.
    pub fn remove_peer(&self, session: &Arc<Session>) -> bool {
        let id = session.internal_id();
        let mut indices = lock(&self.indices);

        if indices.by_internal_id.remove(&id).is_none() {
            error!(error = %RegistryError::NotRegistered(id), "Remove of unknown session ignored");
            return false;
        }

        if let Some(identity_id) = session.identity_id() {
            if let Some(sessions) = indices.by_identity_id.get_mut(&identity_id) {
                sessions.retain(|s| !Arc::ptr_eq(s, session));
                if sessions.is_empty() {
                    indices.by_identity_id.remove(&identity_id);
                }
            }

            if session.is_exclusive_owner() {
                let owns_slot = indices
                    .exclusive_owners
                    .get(&identity_id)
                    .is_some_and(|owner| Arc::ptr_eq(owner, session));
                if owns_slot {
                    indices.exclusive_owners.remove(&identity_id);
                }
                session.set_exclusive_owner(false);
            }
        }

        debug!(session = %session, total = indices.by_internal_id.len(), "Session removed");
        true
    }

    /// The session currently owning an identity.
    pub fn get_exclusive_owner(&self, identity_id: &IdentityId) -> Option<Arc<Session>> {
        lock(&self.indices).exclusive_owners.get(identity_id).cloned()
    }

    /// Check if an identity has an exclusive owner online.
    pub fn is_online(&self, identity_id: &IdentityId) -> bool {
        lock(&self.indices).exclusive_owners.contains_key(identity_id)
    }

    /// Look up a session by internal ID.
    pub fn get(&self, internal_id: u64) -> Option<Arc<Session>> {
        lock(&self.indices).by_internal_id.get(&internal_id).cloned()
    }

    /// Sessions that presented an identity.
    pub fn sessions_for_identity(&self, identity_id: &IdentityId) -> Vec<Arc<Session>> {
        lock(&self.indices)
            .by_identity_id
            .get(identity_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Point-in-time copy of all live sessions, for iteration without the lock.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        lock(&self.indices).by_internal_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.indices).by_internal_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
