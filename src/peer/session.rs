//! Session handle: the shared state of one live connection.

use super::lock;
use crate::identity::{Challenge, IdentityId, PeerIdentity};
use crate::protocol::{envelope, Message, ProtocolError, SemVer};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Upper bound on a graceful write-side shutdown.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Write half of a session's stream, plain or TLS.
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stage of the conversation handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConversationStatus {
    /// No conversation started.
    #[default]
    NoConversation,
    /// Start-conversation completed; waiting for identity verification.
    Started,
    /// The peer proved ownership of its public key.
    Verified,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversationStatus::NoConversation => "none",
            ConversationStatus::Started => "started",
            ConversationStatus::Verified => "verified",
        };
        write!(f, "{}", s)
    }
}

/// Handshake state of a session.
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    pub status: ConversationStatus,
    pub version: Option<SemVer>,
    pub client_challenge: Vec<u8>,
    pub server_challenge: Option<Challenge>,
}

/// One live connection.
///
/// Shared between the session loop, the registry and the idle sweep. Only
/// the registry changes the exclusivity flag, and only while holding its
/// lock.
pub struct Session {
    internal_id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    keep_alive: Duration,
    identity: Mutex<Option<PeerIdentity>>,
    exclusive_owner: AtomicBool,
    keep_alive_deadline: Mutex<Instant>,
    conversation: Mutex<ConversationState>,
    writer: tokio::sync::Mutex<Option<SessionWriter>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Session {
    /// Create an anonymous session. The keep-alive deadline starts now.
    pub fn new(internal_id: u64, remote_addr: SocketAddr, local_addr: SocketAddr, keep_alive: Duration) -> Self {
        Self {
            internal_id,
            remote_addr,
            local_addr,
            keep_alive,
            identity: Mutex::new(None),
            exclusive_owner: AtomicBool::new(false),
            keep_alive_deadline: Mutex::new(Instant::now() + keep_alive),
            conversation: Mutex::new(ConversationState::default()),
            writer: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    // === Accessors ===

    pub fn internal_id(&self) -> u64 {
        self.internal_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Address of the role server endpoint that accepted this session.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> Option<PeerIdentity> {
        *lock(&self.identity)
    }

    pub fn identity_id(&self) -> Option<IdentityId> {
        lock(&self.identity).map(|peer| *peer.identity_id())
    }

    /// Attach the identity the peer declared.
    pub fn set_identity(&self, identity: PeerIdentity) {
        *lock(&self.identity) = Some(identity);
    }

    /// Forget the declared identity.
    pub fn clear_identity(&self) {
        *lock(&self.identity) = None;
    }

    pub fn is_exclusive_owner(&self) -> bool {
        self.exclusive_owner.load(Ordering::SeqCst)
    }

    pub(super) fn set_exclusive_owner(&self, value: bool) {
        self.exclusive_owner.store(value, Ordering::SeqCst);
    }

    // === Keep-alive ===

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn keep_alive_deadline(&self) -> Instant {
        *lock(&self.keep_alive_deadline)
    }

    /// Push the deadline one keep-alive interval past now.
    pub fn refresh_keep_alive(&self) {
        *lock(&self.keep_alive_deadline) = Instant::now() + self.keep_alive;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.keep_alive_deadline()
    }

    // === Conversation ===

    pub fn conversation_status(&self) -> ConversationStatus {
        lock(&self.conversation).status
    }

    /// Run `f` with exclusive access to the handshake state.
    pub fn with_conversation<R>(&self, f: impl FnOnce(&mut ConversationState) -> R) -> R {
        f(&mut lock(&self.conversation))
    }

    // === I/O ===

    /// Install the write half once the stream is ready.
    pub async fn attach_writer(&self, writer: SessionWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Encode and send one message.
    pub async fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        envelope::write_message(writer, message).await
    }

    /// Shut down and drop the write half.
    ///
    /// The shutdown is bounded: a TLS close-notify to a peer that stopped
    /// reading never completes, and dropping the writer closes the socket
    /// anyway.
    pub async fn shutdown_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await;
        }
    }

    // === Close signal ===

    /// Ask the session loop to terminate. Idempotent.
    ///
    /// Takes effect at the loop's next suspension point. The loop then
    /// removes the session from the registry.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once [`close`](Self::close) was called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("internal_id", &format_args!("{:#x}", self.internal_id))
            .field("remote_addr", &self.remote_addr)
            .field("identity_id", &self.identity_id())
            .field("exclusive_owner", &self.is_exclusive_owner())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}@{}", self.internal_id, self.remote_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBuilder;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let session = std::sync::Arc::new(Session::new(1, addr(), addr(), Duration::from_secs(5)));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        session.close();
        session.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_close_before_wait() {
        let session = Session::new(1, addr(), addr(), Duration::from_secs(5));
        session.close();
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_deadline() {
        let session = Session::new(1, addr(), addr(), Duration::from_secs(10));
        assert!(!session.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(session.is_expired(Instant::now()));

        session.refresh_keep_alive();
        assert!(!session.is_expired(Instant::now()));
    }

    #[tokio::test]
    async fn test_send_without_writer_fails() {
        let session = Session::new(1, addr(), addr(), Duration::from_secs(5));
        let message = MessageBuilder::new(0, vec![SemVer::V100], None).create_list_roles_request();
        assert!(matches!(session.send(&message).await, Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let session = Session::new(1, addr(), addr(), Duration::from_secs(5));
        let (a, mut b) = tokio::io::duplex(1024);
        session.attach_writer(Box::new(a)).await;

        let message = MessageBuilder::new(0, vec![SemVer::V100], None).create_ping_request(vec![4]);
        session.send(&message).await.unwrap();
        let got = envelope::read_message(&mut b, 1024).await.unwrap();
        assert_eq!(got, Some(message));

        session.shutdown_writer().await;
        assert_eq!(envelope::read_message(&mut b, 1024).await.unwrap(), None);
    }

    #[test]
    fn test_conversation_state() {
        let session = Session::new(1, addr(), addr(), Duration::from_secs(5));
        assert_eq!(session.conversation_status(), ConversationStatus::NoConversation);
        session.with_conversation(|c| c.status = ConversationStatus::Started);
        assert_eq!(session.conversation_status(), ConversationStatus::Started);
    }
}
