//! IoP server core
//!
//! Network and session core shared by the IoP location and proximity role
//! servers: TCP role servers with a bounded dispatch pipeline, a registry of
//! live sessions keyed by authenticated identity, and the length-prefixed
//! message protocol with its signed challenge-response handshake.

pub mod client;
pub mod config;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod server;

// Re-export identity types
pub use identity::{Challenge, Identity, IdentityError, IdentityId, PeerIdentity, CHALLENGE_SIZE};

// Re-export config types
pub use config::{Config, ConfigError, DirectoryConfig, RoleServerConfig, ServerConfig};

// Re-export protocol types
pub use protocol::{Message, MessageBuilder, ProtocolError, RoleSet, SemVer, ServerRole, Status};

// Re-export peer types
pub use peer::{PeerRegistry, PromotionResult, RegistryError, Session};

// Re-export server types
pub use server::{
    ConversationHandler, HandlerFactory, HandlerOutcome, MessageHandler, RoleServer, RoleServerState,
    ServerError, ServerManager,
};

// Re-export client types
pub use client::{ClientError, DirectoryClient, DirectoryProcessor};
