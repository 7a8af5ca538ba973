//! IoP server daemon binary
//!
//! Loads configuration, starts the role servers and optionally registers the
//! primary port with the location directory.

use async_trait::async_trait;
use clap::Parser;
use iop_server_core::client::{DirectoryClient, DirectoryProcessor};
use iop_server_core::protocol::{LocalServiceRequest, Message, RequestKind, ServiceType};
use iop_server_core::server::{ConversationHandler, HandlerOutcome, ServerManager};
use iop_server_core::{Config, DirectoryConfig, Identity, MessageBuilder, ServerRole};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// How long shutdown waits for the directory deregistration.
const DIRECTORY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// IoP role server daemon
#[derive(Parser, Debug)]
#[command(name = "iop-server", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("IoP server starting");

    // Load configuration
    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if config.has_identity() {
        info!("Using configured identity");
    } else {
        warn!("No identity configured, generating ephemeral keypair");
    }
    let identity = match config.create_identity() {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            error!("Failed to create identity: {}", e);
            std::process::exit(1);
        }
    };
    info!("  identity: {}", identity.identity_id());

    // Start role servers
    let factory = ConversationHandler::factory(identity.clone(), config.server.role_infos());
    let mut manager = ServerManager::new(config.server.clone());
    if let Err(e) = manager.start(factory).await {
        error!("Failed to start role servers: {}", e);
        std::process::exit(1);
    }

    // Directory registration
    let directory = match (&config.directory, manager.local_addr_for(ServerRole::Primary)) {
        (Some(directory_config), Some(primary)) => {
            Some(DirectoryTask::spawn(directory_config.clone(), identity.clone(), primary.port()))
        }
        (Some(_), None) => {
            warn!("Directory configured but no primary role server, skipping registration");
            None
        }
        (None, _) => None,
    };

    info!("IoP server running, press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    info!("IoP server shutting down");

    if let Some(directory) = directory {
        directory.stop().await;
    }
    manager.shutdown().await;

    info!("IoP server shutdown complete");
}

/// Owns the directory connection for the daemon's lifetime.
struct DirectoryTask {
    /// Ends connection attempts and the receive loop, then triggers
    /// deregistration.
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DirectoryTask {
    fn spawn(config: DirectoryConfig, identity: Arc<Identity>, primary_port: u16) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = DirectoryClient::new(config, ServiceType::Profile, shutdown_rx);
        let task = tokio::spawn(run_directory(client, identity, primary_port));
        Self { shutdown_tx, task }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        if tokio::time::timeout(DIRECTORY_STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("Directory client did not stop in time");
            task.abort();
        }
    }
}

/// Stay registered with the directory, reconnecting after every lost
/// connection, until shutdown.
async fn run_directory(mut client: DirectoryClient, identity: Arc<Identity>, primary_port: u16) {
    let processor = NeighbourhoodLogger;

    loop {
        if !register(&mut client, &identity, primary_port).await {
            client.disconnect();
            if client.wait_retry().await.is_err() {
                return;
            }
            continue;
        }

        if let Err(e) = client.receive_message_loop(&processor).await {
            warn!(error = %e, "Directory connection failed");
        }

        if client.is_shutting_down() {
            break;
        }
        warn!("Lost directory connection, registering again");
    }

    if client.is_connected() {
        if let Err(e) = client.deregister_primary_service().await {
            warn!(error = %e, "Failed to deregister from directory");
        }
        client.disconnect();
    }
}

async fn register(client: &mut DirectoryClient, identity: &Identity, primary_port: u16) -> bool {
    if let Err(e) = client.connect().await {
        debug!(error = %e, "Directory connection abandoned");
        return false;
    }
    let service_data = identity.identity_id().as_bytes().to_vec();
    match client.register_primary_service(primary_port, service_data).await {
        Ok(location) => info!(location = %location, "Registered with directory"),
        Err(e) => {
            error!(error = %e, "Directory registration failed");
            return false;
        }
    }
    match client.get_neighbourhood().await {
        Ok(nodes) => info!(neighbours = nodes.len(), "Neighbourhood received"),
        Err(e) => {
            error!(error = %e, "Failed to fetch neighbourhood");
            return false;
        }
    }
    true
}

/// Acknowledges neighbourhood updates; the core server keeps no neighbour state.
struct NeighbourhoodLogger;

#[async_trait]
impl DirectoryProcessor for NeighbourhoodLogger {
    async fn process_message(&self, builder: &MessageBuilder, message: Message) -> HandlerOutcome {
        match message.request().map(|r| &r.kind) {
            Some(RequestKind::LocalService(LocalServiceRequest::NeighbourhoodChanged(changed))) => {
                info!(changes = changed.changes.len(), "Neighbourhood changed");
                HandlerOutcome::reply(builder.create_neighbourhood_changed_response(&message))
            }
            _ => {
                warn!(id = message.id, "Unexpected message from directory");
                HandlerOutcome::reply_and_close(builder.create_error_protocol_violation_response(Some(&message)))
            }
        }
    }
}
