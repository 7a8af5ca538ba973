//! Role server configuration (`server.*`).

use super::ConfigError;
use crate::protocol::{RoleSet, ServerRole, ServerRoleInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default listen address for every role server.
const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default capacity of the accept-to-dispatch queue.
const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 128;

/// Default idle sweep period in seconds.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 1;

/// Default maximum frame body size (1 MB).
const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default bind attempts before giving up.
const DEFAULT_BIND_MAX_ATTEMPTS: u32 = 10;

/// Default base delay between bind attempts.
const DEFAULT_BIND_INTERVAL_MS: u64 = 3000;

/// Default keep-alive window in seconds.
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Identity configuration (`server.identity.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Secret key as 64 hex characters (`server.identity.secret`).
    /// If not specified, a new keypair will be generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Listener bind retry (`server.bind_retry.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindRetryConfig {
    /// Attempts before startup fails (`max_attempts`). Defaults to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Base delay in milliseconds (`interval_ms`). Attempt N waits N times
    /// this before retrying. Defaults to 3000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl BindRetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_BIND_MAX_ATTEMPTS).max(1)
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.unwrap_or(DEFAULT_BIND_INTERVAL_MS)
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.interval_ms().saturating_mul(attempt as u64))
    }
}

/// TLS certificate for encrypted role servers (`server.tls.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
}

/// One role server (`server.role_servers[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleServerConfig {
    /// TCP port. 0 picks an ephemeral port.
    pub port: u16,

    /// Roles served on this port.
    pub roles: Vec<ServerRole>,

    /// Wrap connections in TLS (`encrypted`).
    #[serde(default)]
    pub encrypted: bool,

    /// Idle window before a session is swept (`keep_alive_secs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_secs: Option<u64>,
}

impl RoleServerConfig {
    pub fn new(port: u16, roles: &[ServerRole]) -> Self {
        Self {
            port,
            roles: roles.to_vec(),
            encrypted: false,
            keep_alive_secs: None,
        }
    }

    pub fn role_set(&self) -> RoleSet {
        RoleSet::from_roles(&self.roles)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS))
    }
}

/// Server section (`server.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server identity (`server.identity`).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Listen IP for all role servers (`server.bind_addr`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// Accepted connections waiting for dispatch (`server.dispatch_queue_capacity`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_queue_capacity: Option<usize>,

    /// Idle sweep period (`server.sweep_interval_secs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,

    /// Largest frame body accepted from a peer (`server.max_frame_size`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<usize>,

    #[serde(default)]
    pub bind_retry: BindRetryConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_servers: Vec<RoleServerConfig>,
}

impl ServerConfig {
    /// Parsed listen IP.
    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        let raw = self.bind_addr.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
        raw.parse()
            .map_err(|_| ConfigError::InvalidBindAddr(raw.to_string()))
    }

    pub fn dispatch_queue_capacity(&self) -> usize {
        self.dispatch_queue_capacity
            .unwrap_or(DEFAULT_DISPATCH_QUEUE_CAPACITY)
            .max(1)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS).max(1))
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Role table advertised by list-roles: one entry per role per server.
    pub fn role_infos(&self) -> Vec<ServerRoleInfo> {
        self.role_servers
            .iter()
            .flat_map(|server| {
                server.role_set().iter().map(move |role| ServerRoleInfo {
                    role,
                    port: server.port,
                    is_tcp: true,
                    is_tls: server.encrypted,
                })
            })
            .collect()
    }

    /// Check the role server table before anything binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;

        if self.role_servers.is_empty() {
            return Err(ConfigError::NoRoleServers);
        }

        let mut ports = HashSet::new();
        for server in &self.role_servers {
            if server.roles.is_empty() {
                return Err(ConfigError::EmptyRoles(server.port));
            }
            if server.port != 0 && !ports.insert(server.port) {
                return Err(ConfigError::DuplicatePort(server.port));
            }
            if server.encrypted && self.tls.is_none() {
                return Err(ConfigError::MissingTls(server.port));
            }
        }
        Ok(())
    }
}
