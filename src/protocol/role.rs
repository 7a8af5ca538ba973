//! Server roles and role sets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A declared service function of a role server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// Primary interface: unauthenticated single requests such as role listing.
    Primary,
    /// Interface for neighbouring servers.
    ServerNeighbor,
    /// Interface for clients.
    Client,
}

impl ServerRole {
    /// All roles, in bit order.
    pub const ALL: [ServerRole; 3] = [
        ServerRole::Primary,
        ServerRole::ServerNeighbor,
        ServerRole::Client,
    ];

    /// Bit value of this role within a [`RoleSet`].
    pub fn bit(self) -> u32 {
        match self {
            ServerRole::Primary => 1 << 0,
            ServerRole::ServerNeighbor => 1 << 1,
            ServerRole::Client => 1 << 2,
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerRole::Primary => "primary",
            ServerRole::ServerNeighbor => "server_neighbor",
            ServerRole::Client => "client",
        };
        write!(f, "{}", name)
    }
}

/// Bitmask of the roles served by one role server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleSet(u32);

impl RoleSet {
    /// Create a role set from a list of roles.
    pub fn from_roles(roles: &[ServerRole]) -> Self {
        Self(roles.iter().fold(0, |acc, role| acc | role.bit()))
    }

    /// Raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Check if the set contains a role.
    pub fn contains(&self, role: ServerRole) -> bool {
        self.0 & role.bit() != 0
    }

    /// Check if the set contains any role.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the roles in this set.
    pub fn iter(self) -> impl Iterator<Item = ServerRole> {
        ServerRole::ALL.into_iter().filter(move |role| self.contains(*role))
    }

    /// Base value for message IDs issued by a server with these roles.
    ///
    /// Role bits occupy the top byte so ID spaces of different role servers
    /// are disjoint.
    pub fn id_base(&self) -> u32 {
        self.0 << 24
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|r| r.to_string()).collect();
        write!(f, "[{}]", names.join(","))
    }
}
