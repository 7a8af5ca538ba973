//! Protocol Messages
//!
//! Wire model and codec for role-server communication.
//!
//! ## Framing
//!
//! Every message travels as one frame: a 4-byte big-endian body length
//! followed by the postcard-serialized [`Message`]. See [`envelope`].
//!
//! ## Request families
//!
//! Single requests (ping, list roles) need no authentication. Conversation
//! requests carry a signature field and run the challenge-response handshake
//! that binds a cryptographic identity to a session. Local-service requests
//! are exchanged between a node and its upstream location directory.

mod builder;
pub mod envelope;
mod error;
mod message;
mod role;
mod service;
mod version;

pub use builder::MessageBuilder;
pub use error::ProtocolError;
pub use message::{
    ConversationRequest, ConversationRequestOp, ConversationResponse, ConversationResponseOp,
    DeregisterServiceRequest, DeregisterServiceResponse, GetNeighbourNodesRequest,
    GetNeighbourNodesResponse, ListRolesRequest, ListRolesResponse, LocalServiceRequest,
    LocalServiceResponse, Message, MessageBody, NeighbourhoodChangedRequest,
    NeighbourhoodChangedResponse, PingRequest, PingResponse, RegisterServiceRequest,
    RegisterServiceResponse, Request, RequestKind, Response, ResponseKind, ServerRoleInfo,
    SingleRequest, SingleResponse, SingleResponseOp, StartConversationRequest,
    StartConversationResponse, Status, VerifyIdentityRequest, VerifyIdentityResponse,
};
pub use role::{RoleSet, ServerRole};
pub use service::{GpsLocation, NeighbourhoodChange, NodeInfo, ServiceInfo, ServiceType};
pub use version::SemVer;

#[cfg(test)]
mod tests;
