//! Server Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./iop-server.yaml` (current directory - highest priority)
//! 2. `~/.iop-server.yaml` (home directory)
//! 3. `~/.config/iop-server/iop-server.yaml` (user config directory)
//! 4. `/etc/iop-server/iop-server.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! server:
//!   identity:
//!     secret: "0102...1f20"
//!   role_servers:
//!     - port: 16987
//!       roles: [primary]
//!     - port: 16988
//!       roles: [client, server_neighbor]
//!       encrypted: true
//!   tls:
//!     cert_path: server.crt
//!     key_path: server.key
//! directory:
//!   addr: "127.0.0.1:16982"
//! ```

mod directory;
mod server;

use crate::identity::{Identity, IdentityError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use directory::DirectoryConfig;
pub use server::{BindRetryConfig, IdentityConfig, RoleServerConfig, ServerConfig, TlsConfig};

/// Default config filename.
const CONFIG_FILENAME: &str = "iop-server.yaml";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),

    #[error("no role servers configured")]
    NoRoleServers,

    #[error("role server on port {0} has no roles")]
    EmptyRoles(u16),

    #[error("port {0} used by more than one role server")]
    DuplicatePort(u16),

    #[error("encrypted role server on port {0} requires server.tls")]
    MissingTls(u16),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Role servers and their shared settings (`server.*`).
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream location directory (`directory.*`). No registration when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryConfig>,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Returns a tuple of (config, paths_loaded) where paths_loaded contains
    /// the paths that were successfully loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("/etc/iop-server").join(CONFIG_FILENAME));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("iop-server").join(CONFIG_FILENAME));
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".iop-server.yaml"));
        }

        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present. A
    /// non-empty role server list replaces the whole list.
    pub fn merge(&mut self, other: Config) {
        let (server, o) = (&mut self.server, other.server);
        if o.identity.secret.is_some() {
            server.identity.secret = o.identity.secret;
        }
        if o.bind_addr.is_some() {
            server.bind_addr = o.bind_addr;
        }
        if o.dispatch_queue_capacity.is_some() {
            server.dispatch_queue_capacity = o.dispatch_queue_capacity;
        }
        if o.sweep_interval_secs.is_some() {
            server.sweep_interval_secs = o.sweep_interval_secs;
        }
        if o.max_frame_size.is_some() {
            server.max_frame_size = o.max_frame_size;
        }
        if o.bind_retry.max_attempts.is_some() {
            server.bind_retry.max_attempts = o.bind_retry.max_attempts;
        }
        if o.bind_retry.interval_ms.is_some() {
            server.bind_retry.interval_ms = o.bind_retry.interval_ms;
        }
        if o.tls.is_some() {
            server.tls = o.tls;
        }
        if !o.role_servers.is_empty() {
            server.role_servers = o.role_servers;
        }
        if other.directory.is_some() {
            self.directory = other.directory;
        }
    }

    /// Create an Identity from this configuration.
    ///
    /// If a secret is configured, uses that to create the identity.
    /// Otherwise, generates a new random identity.
    pub fn create_identity(&self) -> Result<Identity, ConfigError> {
        match &self.server.identity.secret {
            Some(secret) => Ok(Identity::from_secret_str(secret)?),
            None => Ok(Identity::generate()),
        }
    }

    /// Check if an identity is configured (vs. will be generated).
    pub fn has_identity(&self) -> bool {
        self.server.identity.secret.is_some()
    }

    /// Validate the configuration. Failure is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(secret) = &self.server.identity.secret {
            Identity::from_secret_str(secret)?;
        }
        self.server.validate()
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerRole;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const SECRET: &str = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";

    fn full_yaml() -> String {
        format!(
            r#"
server:
  identity:
    secret: "{SECRET}"
  bind_addr: "127.0.0.1"
  dispatch_queue_capacity: 16
  sweep_interval_secs: 2
  max_frame_size: 4096
  bind_retry:
    max_attempts: 3
    interval_ms: 100
  tls:
    cert_path: server.crt
    key_path: server.key
  role_servers:
    - port: 16987
      roles: [primary]
      keep_alive_secs: 60
    - port: 16988
      roles: [client, server_neighbor]
      encrypted: true
      keep_alive_secs: 360
directory:
  addr: "127.0.0.1:16982"
  retry_interval_secs: 5
"#
        )
    }

    #[test]
    fn test_empty_config() {
        let config = Config::new();
        assert!(config.server.identity.secret.is_none());
        assert!(!config.has_identity());
        assert!(config.directory.is_none());
        assert!(matches!(config.validate(), Err(ConfigError::NoRoleServers)));
    }

    #[test]
    fn test_parse_full_yaml() {
        let config: Config = serde_yaml::from_str(&full_yaml()).unwrap();
        let server = &config.server;
        assert_eq!(server.bind_ip().unwrap().to_string(), "127.0.0.1");
        assert_eq!(server.dispatch_queue_capacity(), 16);
        assert_eq!(server.sweep_interval(), Duration::from_secs(2));
        assert_eq!(server.max_frame_size(), 4096);
        assert_eq!(server.bind_retry.max_attempts(), 3);
        assert_eq!(server.bind_retry.backoff(2), Duration::from_millis(200));
        assert_eq!(server.role_servers.len(), 2);
        assert_eq!(
            server.role_servers[1].roles,
            vec![ServerRole::Client, ServerRole::ServerNeighbor]
        );
        assert_eq!(server.role_servers[1].keep_alive(), Duration::from_secs(360));
        assert!(server.role_servers[1].encrypted);

        let directory = config.directory.as_ref().unwrap();
        assert_eq!(directory.addr, "127.0.0.1:16982");
        assert_eq!(directory.retry_interval(), Duration::from_secs(5));

        config.validate().unwrap();
        assert!(config.create_identity().is_ok());
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
server:
  role_servers:
    - port: 16987
      roles: [primary]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let server = &config.server;
        assert_eq!(server.bind_ip().unwrap().to_string(), "0.0.0.0");
        assert_eq!(server.dispatch_queue_capacity(), 128);
        assert_eq!(server.sweep_interval(), Duration::from_secs(1));
        assert_eq!(server.bind_retry.max_attempts(), 10);
        assert_eq!(server.bind_retry.interval_ms(), 3000);
        assert_eq!(server.role_servers[0].keep_alive(), Duration::from_secs(60));
        assert!(!server.role_servers[0].encrypted);
        config.validate().unwrap();
    }

    #[test]
    fn test_role_infos() {
        let config: Config = serde_yaml::from_str(&full_yaml()).unwrap();
        let infos = config.server.role_infos();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].role, ServerRole::Primary);
        assert_eq!(infos[0].port, 16987);
        assert!(!infos[0].is_tls);
        assert!(infos[1..].iter().all(|i| i.port == 16988 && i.is_tls));
    }

    #[test]
    fn test_validate_rejects_bad_tables() {
        let mut config = Config::new();
        config.server.role_servers = vec![
            RoleServerConfig::new(1000, &[ServerRole::Primary]),
            RoleServerConfig::new(1000, &[ServerRole::Client]),
        ];
        assert!(matches!(config.validate(), Err(ConfigError::DuplicatePort(1000))));

        config.server.role_servers = vec![RoleServerConfig::new(1000, &[])];
        assert!(matches!(config.validate(), Err(ConfigError::EmptyRoles(1000))));

        let mut encrypted = RoleServerConfig::new(1001, &[ServerRole::Client]);
        encrypted.encrypted = true;
        config.server.role_servers = vec![encrypted];
        assert!(matches!(config.validate(), Err(ConfigError::MissingTls(1001))));

        config.server.role_servers = vec![RoleServerConfig::new(1000, &[ServerRole::Primary])];
        config.server.bind_addr = Some("not-an-ip".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBindAddr(_))));
    }

    #[test]
    fn test_validate_rejects_bad_secret() {
        let mut config = Config::new();
        config.server.role_servers = vec![RoleServerConfig::new(1000, &[ServerRole::Primary])];
        config.server.identity.secret = Some("zz".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Identity(_))));
    }

    #[test]
    fn test_unknown_role_fails_to_parse() {
        let yaml = r#"
server:
  role_servers:
    - port: 1
      roles: [janitor]
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_merge_configs() {
        let mut base: Config = serde_yaml::from_str(&full_yaml()).unwrap();

        let override_yaml = r#"
server:
  bind_addr: "10.0.0.1"
  role_servers:
    - port: 20000
      roles: [client]
"#;
        let other: Config = serde_yaml::from_str(override_yaml).unwrap();
        base.merge(other);

        assert_eq!(base.server.bind_addr.as_deref(), Some("10.0.0.1"));
        assert_eq!(base.server.role_servers.len(), 1);
        assert_eq!(base.server.role_servers[0].port, 20000);
        // Untouched values survive.
        assert_eq!(base.server.identity.secret.as_deref(), Some(SECRET));
        assert_eq!(base.server.max_frame_size(), 4096);
        assert!(base.directory.is_some());
    }

    #[test]
    fn test_load_from_paths() {
        let dir = TempDir::new().unwrap();
        let low = dir.path().join("low.yaml");
        let high = dir.path().join("high.yaml");
        let missing = dir.path().join("missing.yaml");

        fs::write(&low, full_yaml()).unwrap();
        fs::write(&high, "server:\n  max_frame_size: 9999\n").unwrap();

        let (config, loaded) =
            Config::load_from_paths(&[low.clone(), missing, high.clone()]).unwrap();
        assert_eq!(loaded, vec![low, high]);
        assert_eq!(config.server.max_frame_size(), 9999);
        assert_eq!(config.server.role_servers.len(), 2);
    }

    #[test]
    fn test_load_file_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "server: [unclosed").unwrap();
        assert!(matches!(
            Config::load_file(&path),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_search_paths_order() {
        let paths = Config::search_paths();
        assert_eq!(
            paths.first().unwrap(),
            &PathBuf::from("/etc/iop-server/iop-server.yaml")
        );
        assert_eq!(paths.last().unwrap(), &PathBuf::from("./iop-server.yaml"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config: Config = serde_yaml::from_str(&full_yaml()).unwrap();
        let yaml = config.to_yaml().unwrap();
        let reparsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed.server.role_servers.len(), 2);
        assert_eq!(reparsed.server.max_frame_size(), 4096);
    }
}
