//! Built-in handler for single requests and the conversation handshake.

use super::{HandlerContext, HandlerFactory, HandlerOutcome, MessageHandler};
use crate::identity::{Challenge, Identity, PeerIdentity, CHALLENGE_SIZE};
use crate::peer::{ConversationStatus, PeerRegistry, PromotionResult, Session};
use crate::protocol::{
    ConversationRequest, ConversationRequestOp, Message, MessageBody, MessageBuilder, RequestKind,
    RoleSet, SemVer, ServerRole, ServerRoleInfo, SingleRequest, StartConversationRequest,
    VerifyIdentityRequest,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Protocol versions this server speaks, most preferred first.
const SUPPORTED_VERSIONS: [SemVer; 1] = [SemVer::V100];

/// Answers ping and list-roles, and runs the handshake that binds an
/// identity to a session.
///
/// A successful identity verification makes the session the exclusive
/// owner of that identity; an older session holding it is closed.
pub struct ConversationHandler {
    builder: MessageBuilder,
    identity: Arc<Identity>,
    roles: RoleSet,
    registry: Arc<PeerRegistry>,
    role_infos: Arc<Vec<ServerRoleInfo>>,
}

impl ConversationHandler {
    pub fn new(context: &HandlerContext, identity: Arc<Identity>, role_infos: Arc<Vec<ServerRoleInfo>>) -> Self {
        Self {
            builder: MessageBuilder::for_roles(context.roles, SUPPORTED_VERSIONS.to_vec(), Some(identity.clone())),
            identity,
            roles: context.roles,
            registry: context.registry.clone(),
            role_infos,
        }
    }

    /// Factory creating one handler per session.
    ///
    /// `role_infos` is what list-roles advertises.
    pub fn factory(identity: Arc<Identity>, role_infos: Vec<ServerRoleInfo>) -> HandlerFactory {
        let role_infos = Arc::new(role_infos);
        Arc::new(move |context: HandlerContext| -> Box<dyn MessageHandler> {
            Box::new(ConversationHandler::new(&context, identity.clone(), role_infos.clone()))
        })
    }

    fn process_single(&self, message: &Message, request: &SingleRequest) -> Message {
        match request {
            SingleRequest::Ping(ping) => self.builder.create_ping_response(message, ping.payload.clone()),
            SingleRequest::ListRoles(_) => {
                if self.roles.contains(ServerRole::Primary) {
                    self.builder.create_list_roles_response(message, self.role_infos.to_vec())
                } else {
                    self.builder.create_error_bad_role_response(message)
                }
            }
        }
    }

    fn process_conversation(&self, session: &Arc<Session>, message: &Message, request: &ConversationRequest) -> Message {
        if !self.roles.contains(ServerRole::Client) && !self.roles.contains(ServerRole::ServerNeighbor) {
            return self.builder.create_error_bad_role_response(message);
        }
        match &request.operation {
            ConversationRequestOp::StartConversation(start) => self.start_conversation(session, message, start),
            ConversationRequestOp::VerifyIdentity(verify) => self.verify_identity(session, message, verify),
        }
    }

    fn start_conversation(&self, session: &Arc<Session>, message: &Message, start: &StartConversationRequest) -> Message {
        if session.conversation_status() != ConversationStatus::NoConversation {
            return self.builder.create_error_bad_conversation_status_response(message);
        }

        let Some(version) = SemVer::negotiate(&start.supported_versions, self.builder.supported_versions()) else {
            debug!(session = %session, offered = ?start.supported_versions, "No common protocol version");
            return self.builder.create_error_unsupported_response(message);
        };
        let Ok(peer) = PeerIdentity::from_public_key_bytes(&start.public_key) else {
            return self.builder.create_error_invalid_value_response(message, Some("public_key"));
        };
        if start.client_challenge.len() != CHALLENGE_SIZE {
            return self.builder.create_error_invalid_value_response(message, Some("client_challenge"));
        }

        let challenge = Challenge::generate();
        let response = match self.builder.create_start_conversation_response(
            message,
            version,
            &self.identity.public_key_bytes(),
            &challenge,
            &start.client_challenge,
        ) {
            Ok(response) => response,
            Err(e) => {
                error!(session = %session, error = %e, "Failed to sign start conversation response");
                return self.builder.create_error_internal_response(message);
            }
        };

        // The registry indexes the session by the identity it carries.
        session.set_identity(peer);
        if !self.registry.attach_identity(session) {
            session.clear_identity();
            return self.builder.create_error_internal_response(message);
        }
        session.with_conversation(|c| {
            c.status = ConversationStatus::Started;
            c.version = Some(version);
            c.client_challenge = start.client_challenge.clone();
            c.server_challenge = Some(challenge);
        });

        debug!(session = %session, identity = %peer.identity_id(), version = %version, "Conversation started");
        response
    }

    fn verify_identity(&self, session: &Arc<Session>, message: &Message, verify: &VerifyIdentityRequest) -> Message {
        let (status, server_challenge) = session.with_conversation(|c| (c.status, c.server_challenge));
        let (ConversationStatus::Started, Some(server_challenge), Some(peer)) =
            (status, server_challenge, session.identity())
        else {
            return self.builder.create_error_bad_conversation_status_response(message);
        };

        if verify.challenge.as_slice() != server_challenge.as_bytes() {
            return self.builder.create_error_invalid_value_response(message, Some("challenge"));
        }
        if !self.builder.verify_body(message, verify, &peer.public_key_bytes()) {
            warn!(session = %session, identity = %peer.identity_id(), "Identity verification signature invalid");
            return self.builder.create_error_invalid_signature_response(message);
        }

        match self.registry.promote_to_exclusive_owner(session) {
            PromotionResult::Promoted => {}
            PromotionResult::Replaced { evicted } => {
                info!(
                    identity = %peer.identity_id(),
                    session = %session,
                    evicted = %evicted,
                    "Identity reconnected, closing previous session"
                );
                evicted.close();
            }
            PromotionResult::Rejected(e) => {
                error!(session = %session, error = %e, "Failed to promote verified session");
                return self.builder.create_error_internal_response(message);
            }
        }

        session.with_conversation(|c| c.status = ConversationStatus::Verified);
        info!(session = %session, identity = %peer.identity_id(), "Identity verified");
        self.builder.create_verify_identity_response(message)
    }
}

#[async_trait]
impl MessageHandler for ConversationHandler {
    async fn process_message(&self, session: &Arc<Session>, message: Message) -> HandlerOutcome {
        let request = match &message.body {
            MessageBody::Request(request) => request,
            MessageBody::Response(_) => {
                warn!(session = %session, id = message.id, "Unexpected response from peer");
                return HandlerOutcome::reply_and_close(
                    self.builder.create_error_protocol_violation_response(Some(&message)),
                );
            }
        };

        let response = match &request.kind {
            RequestKind::Single(single) => self.process_single(&message, single),
            RequestKind::Conversation(conversation) => self.process_conversation(session, &message, conversation),
            RequestKind::LocalService(_) => self.builder.create_error_unsupported_response(&message),
        };
        HandlerOutcome::reply(response)
    }

    fn protocol_violation(&self) -> Option<Message> {
        Some(self.builder.create_error_protocol_violation_response(None))
    }

    async fn on_disconnect(&self, session: &Arc<Session>) {
        debug!(
            session = %session,
            conversation = %session.conversation_status(),
            "Conversation handler released"
        );
    }
}
