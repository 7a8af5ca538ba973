//! Role server: one listener, its accept and dispatch loops.

use super::session_loop::run_session;
use super::{wait_for_shutdown, HandlerContext, HandlerFactory, RoleServerState, ServerError, STOP_TIMEOUT};
use crate::config::{BindRetryConfig, RoleServerConfig};
use crate::peer::{PeerRegistry, Session};
use crate::protocol::RoleSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Listen backlog.
const LISTEN_BACKLOG: u32 = 1024;

type Accepted = (TcpStream, SocketAddr);

/// Settings shared by every role server of one manager.
#[derive(Clone)]
pub struct RoleServerContext {
    pub bind_ip: IpAddr,
    pub registry: Arc<PeerRegistry>,
    pub handler_factory: HandlerFactory,
    /// Acceptor used by encrypted role servers.
    pub tls: Option<TlsAcceptor>,
    pub dispatch_queue_capacity: usize,
    pub max_frame_size: usize,
    pub bind_retry: BindRetryConfig,
}

/// A TCP listener serving one or more roles.
pub struct RoleServer {
    config: RoleServerConfig,
    context: RoleServerContext,
    state: RoleServerState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<(mpsc::Receiver<Accepted>, JoinSet<()>)>>,
}

impl RoleServer {
    pub fn new(config: RoleServerConfig, context: RoleServerContext) -> Self {
        Self {
            config,
            context,
            state: RoleServerState::Stopped,
            local_addr: None,
            shutdown_tx: None,
            accept_task: None,
            dispatch_task: None,
        }
    }

    pub fn state(&self) -> RoleServerState {
        self.state
    }

    pub fn roles(&self) -> RoleSet {
        self.config.role_set()
    }

    /// Configured port. May be 0; see [`local_addr`](Self::local_addr).
    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn is_encrypted(&self) -> bool {
        self.config.encrypted
    }

    /// Get the local bound address (only valid while running).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the accept and dispatch loops.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if !self.state.can_start() {
            return Err(ServerError::AlreadyStarted);
        }
        let tls = if self.config.encrypted {
            Some(
                self.context
                    .tls
                    .clone()
                    .ok_or(ServerError::TlsNotConfigured(self.config.port))?,
            )
        } else {
            None
        };

        self.state = RoleServerState::Starting;

        let addr = SocketAddr::new(self.context.bind_ip, self.config.port);
        let listener = match bind_with_retry(addr, &self.context.bind_retry).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state = RoleServerState::Stopped;
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state = RoleServerState::Stopped;
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(self.context.dispatch_queue_capacity);

        let dispatcher = Dispatcher {
            local_addr,
            roles: self.config.role_set(),
            keep_alive: self.config.keep_alive(),
            tls,
            context: self.context.clone(),
        };

        self.accept_task = Some(tokio::spawn(accept_loop(listener, queue_tx, shutdown_rx.clone())));
        self.dispatch_task = Some(tokio::spawn(dispatch_loop(queue_rx, dispatcher, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.state = RoleServerState::Running;

        info!(
            local_addr = %local_addr,
            roles = %self.config.role_set(),
            encrypted = self.config.encrypted,
            "Role server started"
        );

        Ok(())
    }

    /// Raise the shutdown signal without waiting for anything.
    pub fn signal_shutdown(&self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(true);
        }
    }

    /// Stop the loops, close the listener and drop queued connections.
    ///
    /// Waits up to a bounded time for each loop and for the session loops
    /// spawned by this server.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        if !self.state.can_stop() {
            return Err(ServerError::NotStarted);
        }
        self.state = RoleServerState::Stopping;
        self.signal_shutdown();

        if let Some(task) = self.accept_task.take() {
            match timeout(STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Accept loop failed"),
                Err(_) => warn!(port = self.config.port, "Accept loop did not stop in time"),
            }
        }

        if let Some(task) = self.dispatch_task.take() {
            match timeout(STOP_TIMEOUT, task).await {
                Ok(Ok((mut queue, mut sessions))) => {
                    queue.close();
                    let mut dropped = 0;
                    while let Ok((_stream, remote_addr)) = queue.try_recv() {
                        trace!(remote_addr = %remote_addr, "Dropping queued connection");
                        dropped += 1;
                    }
                    if dropped > 0 {
                        debug!(count = dropped, "Dropped queued connections");
                    }

                    let drained = timeout(STOP_TIMEOUT, async {
                        while sessions.join_next().await.is_some() {}
                    })
                    .await;
                    if drained.is_err() {
                        warn!(remaining = sessions.len(), "Sessions still running after stop");
                        sessions.detach_all();
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Dispatch loop failed"),
                Err(_) => warn!(port = self.config.port, "Dispatch loop did not stop in time"),
            }
        }

        self.shutdown_tx = None;
        if let Some(addr) = self.local_addr.take() {
            info!(local_addr = %addr, "Role server stopped");
        }
        self.state = RoleServerState::Stopped;
        Ok(())
    }
}

/// Bind with address reuse, retrying while the port is held by a lingering
/// socket. Attempt N waits N times the configured interval.
async fn bind_with_retry(addr: SocketAddr, retry: &BindRetryConfig) -> Result<TcpListener, ServerError> {
    let max_attempts = retry.max_attempts();
    let mut attempt = 1;
    loop {
        match bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    addr = %addr,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Bind failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(addr = %addr, attempts = attempt, error = %e, "Bind failed");
                return Err(ServerError::BindFailed {
                    addr,
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Accept loop - runs as a spawned task. Owns the listener, so the listener
/// closes only after accepting stopped.
async fn accept_loop(listener: TcpListener, queue: mpsc::Sender<Accepted>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote_addr)) => {
                trace!(remote_addr = %remote_addr, "Connection accepted");
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    sent = queue.send((stream, remote_addr)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }

    debug!("Accept loop stopped");
}

/// Turns accepted sockets into registered sessions.
struct Dispatcher {
    local_addr: SocketAddr,
    roles: RoleSet,
    keep_alive: Duration,
    tls: Option<TlsAcceptor>,
    context: RoleServerContext,
}

impl Dispatcher {
    fn dispatch(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        sessions: &mut JoinSet<()>,
        shutdown: watch::Receiver<bool>,
    ) {
        let registry = &self.context.registry;
        let internal_id = registry.next_internal_id();
        let session = Arc::new(Session::new(internal_id, remote_addr, self.local_addr, self.keep_alive));

        if registry.add_peer(session.clone()).is_err() {
            // Dropping the stream closes the connection.
            return;
        }

        let handler = (self.context.handler_factory)(HandlerContext {
            session: session.clone(),
            roles: self.roles,
            registry: registry.clone(),
        });

        debug!(
            session = %session,
            server = %self.local_addr,
            "Session dispatched"
        );

        let task = run_session(
            stream,
            session,
            handler,
            registry.clone(),
            self.tls.clone(),
            self.context.max_frame_size,
            shutdown,
        );
        sessions.spawn(async move {
            task.await;
        });
    }
}

/// Dispatch loop - runs as a spawned task. Hands back the queue and the
/// session tasks so `stop` can drain them.
async fn dispatch_loop(
    mut queue: mpsc::Receiver<Accepted>,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Receiver<Accepted>, JoinSet<()>) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Session task failed");
                }
            }
            accepted = queue.recv() => match accepted {
                Some((stream, remote_addr)) => {
                    dispatcher.dispatch(stream, remote_addr, &mut sessions, shutdown.clone());
                }
                None => break,
            },
        }
    }

    debug!("Dispatch loop stopped");
    (queue, sessions)
}
