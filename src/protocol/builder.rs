//! Message builder: ID allocation, response correlation, body signing and
//! the conversation handshake messages.

use super::envelope;
use super::message::*;
use super::{GpsLocation, NeighbourhoodChange, NodeInfo, ProtocolError, RoleSet, SemVer, ServiceInfo, ServiceType};
use crate::identity::{Challenge, Identity, PeerIdentity};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Builds protocol messages for one endpoint.
///
/// Request IDs start at a role-specific base so the ID spaces of different
/// role servers never overlap. The counter is shared by every task that
/// issues requests through the same builder.
pub struct MessageBuilder {
    id_base: u32,
    id: AtomicU32,
    supported_versions: Vec<SemVer>,
    version: SemVer,
    identity: Option<Arc<Identity>>,
}

impl MessageBuilder {
    /// Create a builder.
    ///
    /// The selected version starts as the most preferred supported version.
    /// Without an identity the builder cannot sign.
    pub fn new(id_base: u32, supported_versions: Vec<SemVer>, identity: Option<Arc<Identity>>) -> Self {
        let version = supported_versions.first().copied().unwrap_or_default();
        Self {
            id_base,
            id: AtomicU32::new(id_base),
            supported_versions,
            version,
            identity,
        }
    }

    /// Create a builder whose ID base is derived from a role set.
    pub fn for_roles(roles: RoleSet, supported_versions: Vec<SemVer>, identity: Option<Arc<Identity>>) -> Self {
        Self::new(roles.id_base(), supported_versions, identity)
    }

    pub fn id_base(&self) -> u32 {
        self.id_base
    }

    pub fn version(&self) -> SemVer {
        self.version
    }

    pub fn supported_versions(&self) -> &[SemVer] {
        &self.supported_versions
    }

    pub fn identity(&self) -> Option<&Arc<Identity>> {
        self.identity.as_ref()
    }

    /// Select the version stamped on new requests.
    pub fn set_protocol_version(&mut self, version: SemVer) {
        self.version = version;
    }

    /// Return the ID counter to the base value.
    pub fn reset_id(&self) {
        self.id.store(self.id_base, Ordering::SeqCst);
    }

    // === Raw bytes ===

    /// Decode a raw frame. Failures are logged and yield `None`; the caller
    /// must close the connection rather than retry the same bytes.
    pub fn create_message_from_raw_data(&self, data: &[u8]) -> Option<Message> {
        match envelope::decode(data) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, len = data.len(), "Failed to decode message");
                None
            }
        }
    }

    /// Encode a message as a complete frame.
    pub fn message_to_bytes(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        envelope::encode(message)
    }

    // === Requests ===

    /// Stamp a fresh ID and the selected version on a request.
    pub fn create_request(&self, kind: RequestKind) -> Message {
        let id = self.id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        Message {
            id,
            body: MessageBody::Request(Request {
                version: self.version,
                kind,
            }),
        }
    }

    pub fn create_single_request(&self, request: SingleRequest) -> Message {
        self.create_request(RequestKind::Single(request))
    }

    /// Conversation request with an empty signature field.
    pub fn create_conversation_request(&self, operation: ConversationRequestOp) -> Message {
        self.create_request(RequestKind::Conversation(ConversationRequest {
            signature: Vec::new(),
            operation,
        }))
    }

    pub fn create_local_service_request(&self, request: LocalServiceRequest) -> Message {
        self.create_request(RequestKind::LocalService(request))
    }

    // === Responses ===

    /// Response answering `request` with the given status and no operation.
    pub fn create_response(&self, request: &Message, status: Status) -> Message {
        Self::response_with_id(request.id, status, None, None)
    }

    /// OK response carrying a result.
    pub fn create_ok_response(&self, request: &Message, kind: ResponseKind) -> Message {
        Self::response_with_id(request.id, Status::Ok, None, Some(kind))
    }

    fn response_with_id(id: u32, status: Status, details: Option<String>, kind: Option<ResponseKind>) -> Message {
        Message {
            id,
            body: MessageBody::Response(Response {
                status,
                details,
                kind,
            }),
        }
    }

    fn error_response(&self, request: &Message, status: Status, details: Option<&str>) -> Message {
        Self::response_with_id(request.id, status, details.map(str::to_string), None)
    }

    /// Protocol violation. Without a request (undecodable input) the ID is 0.
    pub fn create_error_protocol_violation_response(&self, request: Option<&Message>) -> Message {
        let id = request.map(|r| r.id).unwrap_or(0);
        Self::response_with_id(id, Status::ProtocolViolation, None, None)
    }

    pub fn create_error_unsupported_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::Unsupported, None)
    }

    pub fn create_error_banned_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::Banned, None)
    }

    pub fn create_error_busy_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::Busy, None)
    }

    pub fn create_error_unauthorized_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::Unauthorized, None)
    }

    pub fn create_error_bad_role_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::BadRole, None)
    }

    pub fn create_error_bad_conversation_status_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::BadConversationStatus, None)
    }

    pub fn create_error_internal_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::Internal, None)
    }

    pub fn create_error_quota_exceeded_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::QuotaExceeded, None)
    }

    pub fn create_error_invalid_signature_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::InvalidSignature, None)
    }

    pub fn create_error_not_found_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::NotFound, None)
    }

    /// Invalid value; `details` names the offending field.
    pub fn create_error_invalid_value_response(&self, request: &Message, details: Option<&str>) -> Message {
        self.error_response(request, Status::InvalidValue, details)
    }

    pub fn create_error_already_exists_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::AlreadyExists, None)
    }

    pub fn create_error_not_available_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::NotAvailable, None)
    }

    pub fn create_error_rejected_response(&self, request: &Message, details: Option<&str>) -> Message {
        self.error_response(request, Status::Rejected, details)
    }

    pub fn create_error_uninitialized_response(&self, request: &Message) -> Message {
        self.error_response(request, Status::Uninitialized, None)
    }

    /// Single-request response, echoing the request's version.
    pub fn create_single_response(&self, request: &Message, operation: SingleResponseOp) -> Message {
        let version = request.request().map(|r| r.version).unwrap_or(self.version);
        self.create_ok_response(request, ResponseKind::Single(SingleResponse { version, operation }))
    }

    /// Conversation response with an empty signature field.
    pub fn create_conversation_response(&self, request: &Message, operation: ConversationResponseOp) -> Message {
        self.create_ok_response(
            request,
            ResponseKind::Conversation(ConversationResponse {
                signature: Vec::new(),
                operation,
            }),
        )
    }

    pub fn create_local_service_response(&self, request: &Message, response: LocalServiceResponse) -> Message {
        self.create_ok_response(request, ResponseKind::LocalService(response))
    }

    // === Signing ===

    /// Sign raw bytes and store the signature on a conversation message.
    pub fn sign_body_part(&self, message: &mut Message, part: &[u8]) -> Result<(), ProtocolError> {
        let identity = self.identity.as_ref().ok_or(ProtocolError::NoSigningKey)?;
        let slot = message.signature_mut().ok_or(ProtocolError::NotConversation)?;
        *slot = identity.sign_bytes(part).to_vec();
        Ok(())
    }

    /// Sign the serialized form of a sub-message.
    pub fn sign_body<T: Serialize>(&self, message: &mut Message, body: &T) -> Result<(), ProtocolError> {
        let bytes = postcard::to_allocvec(body).map_err(ProtocolError::Encode)?;
        self.sign_body_part(message, &bytes)
    }

    /// Verify a conversation message's signature over raw bytes.
    ///
    /// Returns false for a missing, malformed or invalid signature, a
    /// non-conversation message, or an unusable public key.
    pub fn verify_body_part(&self, message: &Message, part: &[u8], public_key: &[u8]) -> bool {
        let Some(signature) = message.signature() else {
            return false;
        };
        if signature.is_empty() {
            return false;
        }
        match PeerIdentity::from_public_key_bytes(public_key) {
            Ok(peer) => peer.verify_bytes(part, signature),
            Err(_) => false,
        }
    }

    /// Verify a conversation message's signature over a serialized sub-message.
    pub fn verify_body<T: Serialize>(&self, message: &Message, body: &T, public_key: &[u8]) -> bool {
        match postcard::to_allocvec(body) {
            Ok(bytes) => self.verify_body_part(message, &bytes, public_key),
            Err(_) => false,
        }
    }

    // === Single requests ===

    pub fn create_ping_request(&self, payload: Vec<u8>) -> Message {
        self.create_single_request(SingleRequest::Ping(PingRequest { payload }))
    }

    /// Ping response carrying the current clock in unix milliseconds.
    pub fn create_ping_response(&self, request: &Message, payload: Vec<u8>) -> Message {
        let clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.create_single_response(request, SingleResponseOp::Ping(PingResponse { clock, payload }))
    }

    pub fn create_list_roles_request(&self) -> Message {
        self.create_single_request(SingleRequest::ListRoles(ListRolesRequest::default()))
    }

    pub fn create_list_roles_response(&self, request: &Message, roles: Vec<ServerRoleInfo>) -> Message {
        self.create_single_response(request, SingleResponseOp::ListRoles(ListRolesResponse { roles }))
    }

    // === Conversation handshake ===

    /// Open a conversation: our public key, supported versions and a client
    /// challenge the server must sign.
    pub fn create_start_conversation_request(&self, client_challenge: &Challenge) -> Result<Message, ProtocolError> {
        let identity = self.identity.as_ref().ok_or(ProtocolError::NoSigningKey)?;
        Ok(self.create_conversation_request(ConversationRequestOp::StartConversation(
            StartConversationRequest {
                supported_versions: self.supported_versions.clone(),
                public_key: identity.public_key_bytes().to_vec(),
                client_challenge: client_challenge.to_vec(),
            },
        )))
    }

    /// Answer a conversation start. The signature covers the echoed client
    /// challenge, proving we hold the key for `public_key`.
    pub fn create_start_conversation_response(
        &self,
        request: &Message,
        version: SemVer,
        public_key: &[u8],
        challenge: &Challenge,
        client_challenge: &[u8],
    ) -> Result<Message, ProtocolError> {
        let mut response = self.create_conversation_response(
            request,
            ConversationResponseOp::StartConversation(StartConversationResponse {
                version,
                public_key: public_key.to_vec(),
                challenge: challenge.to_vec(),
                client_challenge: client_challenge.to_vec(),
            }),
        );
        self.sign_body_part(&mut response, client_challenge)?;
        Ok(response)
    }

    /// Prove our identity by signing the server's challenge.
    pub fn create_verify_identity_request(&self, challenge: &[u8]) -> Result<Message, ProtocolError> {
        let body = VerifyIdentityRequest {
            challenge: challenge.to_vec(),
        };
        let mut request =
            self.create_conversation_request(ConversationRequestOp::VerifyIdentity(body.clone()));
        self.sign_body(&mut request, &body)?;
        Ok(request)
    }

    pub fn create_verify_identity_response(&self, request: &Message) -> Message {
        self.create_conversation_response(
            request,
            ConversationResponseOp::VerifyIdentity(VerifyIdentityResponse::default()),
        )
    }

    // === Local service ===

    pub fn create_register_service_request(&self, service: ServiceInfo) -> Message {
        self.create_local_service_request(LocalServiceRequest::RegisterService(RegisterServiceRequest { service }))
    }

    pub fn create_register_service_response(&self, request: &Message, location: GpsLocation) -> Message {
        self.create_local_service_response(
            request,
            LocalServiceResponse::RegisterService(RegisterServiceResponse { location }),
        )
    }

    pub fn create_deregister_service_request(&self, service_type: ServiceType) -> Message {
        self.create_local_service_request(LocalServiceRequest::DeregisterService(DeregisterServiceRequest {
            service_type,
        }))
    }

    pub fn create_deregister_service_response(&self, request: &Message) -> Message {
        self.create_local_service_response(
            request,
            LocalServiceResponse::DeregisterService(DeregisterServiceResponse::default()),
        )
    }

    pub fn create_get_neighbour_nodes_request(&self, keep_alive: bool) -> Message {
        self.create_local_service_request(LocalServiceRequest::GetNeighbourNodes(GetNeighbourNodesRequest {
            keep_alive,
        }))
    }

    pub fn create_get_neighbour_nodes_response(&self, request: &Message, nodes: Vec<NodeInfo>) -> Message {
        self.create_local_service_response(
            request,
            LocalServiceResponse::GetNeighbourNodes(GetNeighbourNodesResponse { nodes }),
        )
    }

    pub fn create_neighbourhood_changed_request(&self, changes: Vec<NeighbourhoodChange>) -> Message {
        self.create_local_service_request(LocalServiceRequest::NeighbourhoodChanged(NeighbourhoodChangedRequest {
            changes,
        }))
    }

    pub fn create_neighbourhood_changed_response(&self, request: &Message) -> Message {
        self.create_local_service_response(
            request,
            LocalServiceResponse::NeighbourhoodChanged(NeighbourhoodChangedResponse::default()),
        )
    }
}
