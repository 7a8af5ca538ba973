//! Protocol message model: requests, responses, statuses and operations.

use super::{GpsLocation, NeighbourhoodChange, NodeInfo, SemVer, ServerRole, ServiceInfo, ServiceType};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Envelope body
// ============================================================================

/// A protocol message: a correlation ID plus either a request or a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u32,
    pub body: MessageBody,
}

/// Request or response payload of a [`Message`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Request(Request),
    Response(Response),
}

impl Message {
    /// The request carried by this message, if any.
    pub fn request(&self) -> Option<&Request> {
        match &self.body {
            MessageBody::Request(request) => Some(request),
            MessageBody::Response(_) => None,
        }
    }

    /// The response carried by this message, if any.
    pub fn response(&self) -> Option<&Response> {
        match &self.body {
            MessageBody::Response(response) => Some(response),
            MessageBody::Request(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.body, MessageBody::Request(_))
    }

    /// Signature field of a conversation request or response.
    pub fn signature(&self) -> Option<&[u8]> {
        match &self.body {
            MessageBody::Request(Request {
                kind: RequestKind::Conversation(c),
                ..
            }) => Some(&c.signature),
            MessageBody::Response(Response {
                kind: Some(ResponseKind::Conversation(c)),
                ..
            }) => Some(&c.signature),
            _ => None,
        }
    }

    /// Mutable signature field of a conversation request or response.
    pub fn signature_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.body {
            MessageBody::Request(Request {
                kind: RequestKind::Conversation(c),
                ..
            }) => Some(&mut c.signature),
            MessageBody::Response(Response {
                kind: Some(ResponseKind::Conversation(c)),
                ..
            }) => Some(&mut c.signature),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            MessageBody::Request(r) => write!(f, "request #{} {}", self.id, r.name()),
            MessageBody::Response(r) => write!(f, "response #{} {}", self.id, r.status),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A versioned request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub version: SemVer,
    pub kind: RequestKind,
}

/// Request families.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Unauthenticated one-shot requests.
    Single(SingleRequest),
    /// Requests within a signed conversation.
    Conversation(ConversationRequest),
    /// Traffic between a node and its location directory.
    LocalService(LocalServiceRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingleRequest {
    Ping(PingRequest),
    ListRoles(ListRolesRequest),
}

/// A conversation request with its signature field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub signature: Vec<u8>,
    pub operation: ConversationRequestOp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationRequestOp {
    StartConversation(StartConversationRequest),
    VerifyIdentity(VerifyIdentityRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalServiceRequest {
    RegisterService(RegisterServiceRequest),
    DeregisterService(DeregisterServiceRequest),
    GetNeighbourNodes(GetNeighbourNodesRequest),
    NeighbourhoodChanged(NeighbourhoodChangedRequest),
}

impl Request {
    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            RequestKind::Single(SingleRequest::Ping(_)) => "Ping",
            RequestKind::Single(SingleRequest::ListRoles(_)) => "ListRoles",
            RequestKind::Conversation(c) => match c.operation {
                ConversationRequestOp::StartConversation(_) => "StartConversation",
                ConversationRequestOp::VerifyIdentity(_) => "VerifyIdentity",
            },
            RequestKind::LocalService(l) => match l {
                LocalServiceRequest::RegisterService(_) => "RegisterService",
                LocalServiceRequest::DeregisterService(_) => "DeregisterService",
                LocalServiceRequest::GetNeighbourNodes(_) => "GetNeighbourNodes",
                LocalServiceRequest::NeighbourhoodChanged(_) => "NeighbourhoodChanged",
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRolesRequest {}

/// First message of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartConversationRequest {
    /// Versions the client speaks, most preferred first.
    pub supported_versions: Vec<SemVer>,
    pub public_key: Vec<u8>,
    pub client_challenge: Vec<u8>,
}

/// Proves the client holds the key it declared. The signature covers the
/// serialized form of this struct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyIdentityRequest {
    pub challenge: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterServiceRequest {
    pub service: ServiceInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterServiceRequest {
    pub service_type: ServiceType,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNeighbourNodesRequest {
    /// Keep the connection open for change notifications.
    pub keep_alive: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourhoodChangedRequest {
    pub changes: Vec<NeighbourhoodChange>,
}

// ============================================================================
// Responses
// ============================================================================

/// Response status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ProtocolViolation,
    Unsupported,
    Banned,
    Busy,
    Unauthorized,
    BadRole,
    BadConversationStatus,
    Internal,
    QuotaExceeded,
    InvalidSignature,
    NotFound,
    InvalidValue,
    AlreadyExists,
    NotAvailable,
    Rejected,
    Uninitialized,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::ProtocolViolation => "ERROR_PROTOCOL_VIOLATION",
            Status::Unsupported => "ERROR_UNSUPPORTED",
            Status::Banned => "ERROR_BANNED",
            Status::Busy => "ERROR_BUSY",
            Status::Unauthorized => "ERROR_UNAUTHORIZED",
            Status::BadRole => "ERROR_BAD_ROLE",
            Status::BadConversationStatus => "ERROR_BAD_CONVERSATION_STATUS",
            Status::Internal => "ERROR_INTERNAL",
            Status::QuotaExceeded => "ERROR_QUOTA_EXCEEDED",
            Status::InvalidSignature => "ERROR_INVALID_SIGNATURE",
            Status::NotFound => "ERROR_NOT_FOUND",
            Status::InvalidValue => "ERROR_INVALID_VALUE",
            Status::AlreadyExists => "ERROR_ALREADY_EXISTS",
            Status::NotAvailable => "ERROR_NOT_AVAILABLE",
            Status::Rejected => "ERROR_REJECTED",
            Status::Uninitialized => "ERROR_UNINITIALIZED",
        };
        write!(f, "{}", name)
    }
}

/// A response. `kind` is absent for error responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub details: Option<String>,
    pub kind: Option<ResponseKind>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Single(SingleResponse),
    Conversation(ConversationResponse),
    LocalService(LocalServiceResponse),
}

/// Single-request response; echoes the request's version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleResponse {
    pub version: SemVer,
    pub operation: SingleResponseOp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingleResponseOp {
    Ping(PingResponse),
    ListRoles(ListRolesResponse),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub signature: Vec<u8>,
    pub operation: ConversationResponseOp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationResponseOp {
    StartConversation(StartConversationResponse),
    VerifyIdentity(VerifyIdentityResponse),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalServiceResponse {
    RegisterService(RegisterServiceResponse),
    DeregisterService(DeregisterServiceResponse),
    GetNeighbourNodes(GetNeighbourNodesResponse),
    NeighbourhoodChanged(NeighbourhoodChangedResponse),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Server clock, unix milliseconds.
    pub clock: u64,
    pub payload: Vec<u8>,
}

/// One role server as advertised by the primary port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRoleInfo {
    pub role: ServerRole,
    pub port: u16,
    pub is_tcp: bool,
    pub is_tls: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRolesResponse {
    pub roles: Vec<ServerRoleInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartConversationResponse {
    pub version: SemVer,
    pub public_key: Vec<u8>,
    /// Fresh server challenge the client must sign next.
    pub challenge: Vec<u8>,
    pub client_challenge: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyIdentityResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterServiceResponse {
    pub location: GpsLocation,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterServiceResponse {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNeighbourNodesResponse {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourhoodChangedResponse {}
