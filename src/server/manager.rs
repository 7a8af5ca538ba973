//! Server manager: the registry, all role servers and the idle sweep.

use super::role::{RoleServer, RoleServerContext};
use super::{load_tls_acceptor, wait_for_shutdown, HandlerFactory, ServerError};
use crate::config::ServerConfig;
use crate::peer::PeerRegistry;
use crate::protocol::ServerRole;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Close every session whose keep-alive deadline has passed.
///
/// Only signals the sessions; each one leaves the registry from its own loop.
/// Returns the number of sessions closed.
pub fn sweep_idle_connections(registry: &PeerRegistry) -> usize {
    let now = Instant::now();
    let mut closed = 0;
    for session in registry.snapshot() {
        if !session.is_closed() && session.is_expired(now) {
            debug!(session = %session, "Closing idle session");
            session.close();
            closed += 1;
        }
    }
    closed
}

/// Owns the role servers sharing one peer registry.
pub struct ServerManager {
    config: ServerConfig,
    registry: Arc<PeerRegistry>,
    servers: Vec<RoleServer>,
    sweep_shutdown: Option<watch::Sender<bool>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl ServerManager {
    /// Create a manager and its registry. Nothing listens until `start`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(PeerRegistry::new()),
            servers: Vec::new(),
            sweep_shutdown: None,
            sweep_task: None,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn servers(&self) -> &[RoleServer] {
        &self.servers
    }

    pub fn is_running(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Bound address of the first server carrying `role`.
    pub fn local_addr_for(&self, role: ServerRole) -> Option<SocketAddr> {
        self.servers
            .iter()
            .find(|s| s.roles().contains(role))
            .and_then(|s| s.local_addr())
    }

    /// Start every configured role server, all or nothing.
    ///
    /// If one server fails to start, the ones already running are stopped
    /// and the error is returned.
    pub async fn start(&mut self, handler_factory: HandlerFactory) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyStarted);
        }
        self.config.validate()?;

        let tls = match &self.config.tls {
            Some(tls) if self.config.role_servers.iter().any(|s| s.encrypted) => {
                Some(load_tls_acceptor(&tls.cert_path, &tls.key_path)?)
            }
            _ => None,
        };

        let context = RoleServerContext {
            bind_ip: self.config.bind_ip()?,
            registry: self.registry.clone(),
            handler_factory,
            tls,
            dispatch_queue_capacity: self.config.dispatch_queue_capacity(),
            max_frame_size: self.config.max_frame_size(),
            bind_retry: self.config.bind_retry.clone(),
        };

        let role_servers = self.config.role_servers.clone();
        for server_config in role_servers {
            let port = server_config.port;
            let mut server = RoleServer::new(server_config, context.clone());
            if let Err(e) = server.start().await {
                error!(port, error = %e, "Role server failed to start");
                self.stop_servers().await;
                return Err(e);
            }
            self.servers.push(server);
        }

        let (sweep_tx, sweep_rx) = watch::channel(false);
        self.sweep_task = Some(tokio::spawn(sweep_loop(
            self.registry.clone(),
            self.config.sweep_interval(),
            sweep_rx,
        )));
        self.sweep_shutdown = Some(sweep_tx);

        info!(servers = self.servers.len(), "Server manager started");
        Ok(())
    }

    /// Close idle sessions now. The sweep task calls this on its interval.
    pub fn sweep_idle_connections(&self) -> usize {
        sweep_idle_connections(&self.registry)
    }

    /// Signal every server, close every live session, stop every server.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.sweep_shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.sweep_task.take() {
            let _ = task.await;
        }

        for server in &self.servers {
            server.signal_shutdown();
        }

        let sessions = self.registry.snapshot();
        debug!(count = sessions.len(), "Closing live sessions");
        for session in sessions {
            session.close();
        }

        self.stop_servers().await;
        info!("Server manager stopped");
    }

    async fn stop_servers(&mut self) {
        for mut server in self.servers.drain(..) {
            if let Err(e) = server.stop().await {
                debug!(port = server.port(), error = %e, "Role server stop failed");
            }
        }
    }
}

async fn sweep_loop(registry: Arc<PeerRegistry>, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                let closed = sweep_idle_connections(&registry);
                if closed > 0 {
                    debug!(closed, "Idle sweep closed sessions");
                }
            }
        }
    }
}
