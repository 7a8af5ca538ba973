use super::*;
use crate::identity::{Challenge, Identity, CHALLENGE_SIZE};
use std::collections::HashSet;
use std::sync::Arc;

fn signing_builder() -> MessageBuilder {
    MessageBuilder::new(0, vec![SemVer::V100], Some(Arc::new(Identity::generate())))
}

fn sample_messages(builder: &MessageBuilder) -> Vec<Message> {
    let ping = builder.create_ping_request(vec![1, 2, 3]);
    let service = ServiceInfo {
        service_type: ServiceType::Profile,
        port: 16987,
        service_data: vec![0xde, 0xad],
    };
    vec![
        ping.clone(),
        builder.create_list_roles_request(),
        builder.create_ping_response(&ping, vec![1, 2, 3]),
        builder.create_error_invalid_value_response(&ping, Some("payload")),
        builder.create_register_service_request(service),
        builder.create_get_neighbour_nodes_response(
            &ping,
            vec![NodeInfo {
                node_id: vec![7; 32],
                ip_address: vec![127, 0, 0, 1],
                port: 16980,
                location: GpsLocation::new(1, 2),
                services: vec![],
            }],
        ),
        builder
            .create_start_conversation_request(&Challenge::generate())
            .unwrap(),
    ]
}

// ===== Envelope codec =====

#[test]
fn test_envelope_roundtrip() {
    let builder = signing_builder();
    for message in sample_messages(&builder) {
        let frame = envelope::encode(&message).unwrap();
        assert_eq!(envelope::decode(&frame).unwrap(), message);
    }
}

#[test]
fn test_envelope_header_is_body_length() {
    let builder = signing_builder();
    let frame = envelope::encode(&builder.create_ping_request(vec![9; 40])).unwrap();
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(declared, frame.len() - envelope::HEADER_SIZE);
}

#[test]
fn test_decode_short_input_fails() {
    let builder = signing_builder();
    let frame = envelope::encode(&builder.create_ping_request(vec![5; 16])).unwrap();
    for cut in 0..frame.len() {
        let err = envelope::decode(&frame[..cut]).unwrap_err();
        assert!(err.is_framing(), "cut at {} gave {:?}", cut, err);
    }
}

#[test]
fn test_take_message_waits_for_whole_frame() {
    let builder = signing_builder();
    let first = builder.create_ping_request(vec![1; 40]);
    let second = builder.create_list_roles_request();
    let mut stream = envelope::encode(&first).unwrap();
    stream.extend(envelope::encode(&second).unwrap());

    let mut buf = Vec::new();
    let mut taken = Vec::new();
    for chunk in stream.chunks(7) {
        buf.extend_from_slice(chunk);
        while let Some(message) = envelope::take_message(&mut buf, envelope::DEFAULT_MAX_FRAME_SIZE).unwrap() {
            taken.push(message);
        }
    }
    assert_eq!(taken, vec![first, second]);
    assert!(buf.is_empty());
}

#[test]
fn test_take_message_rejects_oversized_header() {
    let mut buf = 1000u32.to_be_bytes().to_vec();
    assert!(matches!(
        envelope::take_message(&mut buf, 100),
        Err(ProtocolError::FrameTooLarge { max: 100, got: 1000 })
    ));
}

#[test]
fn test_decode_declared_length_exceeds_available() {
    let mut frame = 10u32.to_be_bytes().to_vec();
    frame.extend_from_slice(&[1, 2, 3]);
    assert!(matches!(
        envelope::decode(&frame),
        Err(ProtocolError::FrameTooShort { expected: 14, got: 7 })
    ));
}

#[test]
fn test_decode_trailing_bytes_fail() {
    let builder = signing_builder();
    let mut frame = envelope::encode(&builder.create_list_roles_request()).unwrap();
    frame.push(0);
    assert!(matches!(
        envelope::decode(&frame),
        Err(ProtocolError::MalformedFrame(_))
    ));
}

#[test]
fn test_decode_garbage_body_fails() {
    let mut frame = 4u32.to_be_bytes().to_vec();
    frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    assert!(matches!(
        envelope::decode(&frame),
        Err(ProtocolError::MalformedFrame(_))
    ));
}

#[tokio::test]
async fn test_read_frame_stream() {
    let builder = signing_builder();
    let first = builder.create_ping_request(vec![1]);
    let second = builder.create_list_roles_request();

    let (mut a, mut b) = tokio::io::duplex(4096);
    envelope::write_message(&mut a, &first).await.unwrap();
    envelope::write_message(&mut a, &second).await.unwrap();
    drop(a);

    let max = envelope::DEFAULT_MAX_FRAME_SIZE;
    assert_eq!(envelope::read_message(&mut b, max).await.unwrap(), Some(first));
    assert_eq!(envelope::read_message(&mut b, max).await.unwrap(), Some(second));
    assert_eq!(envelope::read_message(&mut b, max).await.unwrap(), None);
}

#[tokio::test]
async fn test_read_frame_truncated_body() {
    use tokio::io::AsyncWriteExt;

    let (mut a, mut b) = tokio::io::duplex(64);
    a.write_all(&10u32.to_be_bytes()).await.unwrap();
    a.write_all(&[1, 2, 3]).await.unwrap();
    drop(a);

    match envelope::read_frame(&mut b, 1024).await {
        Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("expected eof, got {:?}", other),
    }
}

#[tokio::test]
async fn test_read_frame_rejects_oversized() {
    use tokio::io::AsyncWriteExt;

    let (mut a, mut b) = tokio::io::duplex(64);
    a.write_all(&5000u32.to_be_bytes()).await.unwrap();

    assert!(matches!(
        envelope::read_frame(&mut b, 1024).await,
        Err(ProtocolError::FrameTooLarge { max: 1024, got: 5000 })
    ));
}

// ===== Builder =====

#[test]
fn test_request_ids_increment_from_base() {
    let roles = RoleSet::from_roles(&[ServerRole::Client]);
    let builder = MessageBuilder::for_roles(roles, vec![SemVer::V100], None);
    assert_eq!(builder.create_ping_request(vec![]).id, roles.id_base() + 1);
    assert_eq!(builder.create_ping_request(vec![]).id, roles.id_base() + 2);

    builder.reset_id();
    assert_eq!(builder.create_ping_request(vec![]).id, roles.id_base() + 1);
}

#[test]
fn test_concurrent_request_ids_are_contiguous() {
    let builder = MessageBuilder::new(1000, vec![SemVer::V100], None);
    let threads = 8;
    let per_thread = 250;

    let ids: Vec<u32> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    (0..per_thread)
                        .map(|_| builder.create_list_roles_request().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: HashSet<u32> = ids.iter().copied().collect();
    assert_eq!(unique.len(), threads * per_thread);

    let mut sorted = ids;
    sorted.sort_unstable();
    for (i, id) in sorted.iter().enumerate() {
        assert_eq!(*id, 1001 + i as u32);
    }
}

#[test]
fn test_request_carries_selected_version() {
    let mut builder = MessageBuilder::new(0, vec![SemVer::V100, SemVer::new(1, 1, 0)], None);
    assert_eq!(builder.version(), SemVer::V100);
    builder.set_protocol_version(SemVer::new(1, 1, 0));

    let request = builder.create_ping_request(vec![]);
    assert_eq!(request.request().unwrap().version, SemVer::new(1, 1, 0));
}

#[test]
fn test_every_response_constructor_correlates() {
    let builder = signing_builder();
    let request = builder.create_ping_request(vec![]);

    let responses = vec![
        (builder.create_response(&request, Status::Ok), Status::Ok),
        (
            builder.create_error_protocol_violation_response(Some(&request)),
            Status::ProtocolViolation,
        ),
        (builder.create_error_unsupported_response(&request), Status::Unsupported),
        (builder.create_error_banned_response(&request), Status::Banned),
        (builder.create_error_busy_response(&request), Status::Busy),
        (builder.create_error_unauthorized_response(&request), Status::Unauthorized),
        (builder.create_error_bad_role_response(&request), Status::BadRole),
        (
            builder.create_error_bad_conversation_status_response(&request),
            Status::BadConversationStatus,
        ),
        (builder.create_error_internal_response(&request), Status::Internal),
        (builder.create_error_quota_exceeded_response(&request), Status::QuotaExceeded),
        (
            builder.create_error_invalid_signature_response(&request),
            Status::InvalidSignature,
        ),
        (builder.create_error_not_found_response(&request), Status::NotFound),
        (
            builder.create_error_invalid_value_response(&request, None),
            Status::InvalidValue,
        ),
        (builder.create_error_already_exists_response(&request), Status::AlreadyExists),
        (builder.create_error_not_available_response(&request), Status::NotAvailable),
        (
            builder.create_error_rejected_response(&request, Some("full")),
            Status::Rejected,
        ),
        (builder.create_error_uninitialized_response(&request), Status::Uninitialized),
    ];

    for (response, status) in responses {
        assert_eq!(response.id, request.id);
        let body = response.response().unwrap();
        assert_eq!(body.status, status);
        assert!(body.kind.is_none());
    }
}

#[test]
fn test_error_details() {
    let builder = signing_builder();
    let request = builder.create_ping_request(vec![]);
    let response = builder.create_error_invalid_value_response(&request, Some("challenge"));
    assert_eq!(response.response().unwrap().details.as_deref(), Some("challenge"));
}

#[test]
fn test_protocol_violation_without_request_uses_id_zero() {
    let builder = signing_builder();
    let response = builder.create_error_protocol_violation_response(None);
    assert_eq!(response.id, 0);
    assert_eq!(response.response().unwrap().status, Status::ProtocolViolation);
}

#[test]
fn test_single_response_echoes_version() {
    let mut builder = signing_builder();
    builder.set_protocol_version(SemVer::new(1, 4, 2));
    let request = builder.create_ping_request(vec![1]);

    let server = MessageBuilder::new(0, vec![SemVer::V100], None);
    let response = server.create_ping_response(&request, vec![1]);
    match &response.response().unwrap().kind {
        Some(ResponseKind::Single(single)) => assert_eq!(single.version, SemVer::new(1, 4, 2)),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_create_from_raw_data() {
    let builder = signing_builder();
    let message = builder.create_list_roles_request();
    let bytes = builder.message_to_bytes(&message).unwrap();
    assert_eq!(builder.create_message_from_raw_data(&bytes), Some(message));
    assert_eq!(builder.create_message_from_raw_data(&bytes[..bytes.len() - 1]), None);
    assert_eq!(builder.create_message_from_raw_data(&[]), None);
}

// ===== Signing =====

#[test]
fn test_sign_verify_body_part() {
    let builder = signing_builder();
    let public_key = builder.identity().unwrap().public_key_bytes();
    let body = b"some body bytes".to_vec();

    let mut message = builder.create_verify_identity_request(&[0u8; CHALLENGE_SIZE]).unwrap();
    builder.sign_body_part(&mut message, &body).unwrap();
    assert!(builder.verify_body_part(&message, &body, &public_key));

    for i in 0..body.len() {
        let mut tampered = body.clone();
        tampered[i] ^= 0x01;
        assert!(!builder.verify_body_part(&message, &tampered, &public_key));
    }
}

#[test]
fn test_verify_rejects_missing_signature() {
    let builder = signing_builder();
    let public_key = builder.identity().unwrap().public_key_bytes();
    let message = builder.create_conversation_request(ConversationRequestOp::VerifyIdentity(
        VerifyIdentityRequest { challenge: vec![1] },
    ));
    assert!(!builder.verify_body_part(&message, &[1], &public_key));

    let single = builder.create_ping_request(vec![]);
    assert!(!builder.verify_body_part(&single, &[], &public_key));
}

#[test]
fn test_verify_rejects_bad_public_key() {
    let builder = signing_builder();
    let message = builder.create_verify_identity_request(&[3u8; 32]).unwrap();
    let body = VerifyIdentityRequest {
        challenge: vec![3u8; 32],
    };
    assert!(!builder.verify_body(&message, &body, &[0u8; 5]));
    let other = Identity::generate();
    assert!(!builder.verify_body(&message, &body, &other.public_key_bytes()));
}

#[test]
fn test_sign_requires_identity_and_conversation() {
    let unsigned = MessageBuilder::new(0, vec![SemVer::V100], None);
    let mut message = unsigned.create_conversation_request(ConversationRequestOp::VerifyIdentity(
        VerifyIdentityRequest { challenge: vec![] },
    ));
    assert!(matches!(
        unsigned.sign_body_part(&mut message, b"x"),
        Err(ProtocolError::NoSigningKey)
    ));

    let builder = signing_builder();
    let mut ping = builder.create_ping_request(vec![]);
    assert!(matches!(
        builder.sign_body_part(&mut ping, b"x"),
        Err(ProtocolError::NotConversation)
    ));
}

// ===== Handshake =====

#[test]
fn test_start_conversation_handshake_signatures() {
    let client = signing_builder();
    let server = signing_builder();
    let client_challenge = Challenge::from_bytes([0xAA; CHALLENGE_SIZE]);

    let request = client.create_start_conversation_request(&client_challenge).unwrap();
    let start = match &request.request().unwrap().kind {
        RequestKind::Conversation(ConversationRequest {
            operation: ConversationRequestOp::StartConversation(start),
            ..
        }) => start.clone(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(start.supported_versions, vec![SemVer::V100]);
    assert_eq!(start.public_key, client.identity().unwrap().public_key_bytes().to_vec());
    assert_eq!(start.client_challenge, vec![0xAA; CHALLENGE_SIZE]);

    let server_key = server.identity().unwrap().public_key_bytes();
    let server_challenge = Challenge::generate();
    let response = server
        .create_start_conversation_response(
            &request,
            SemVer::V100,
            &server_key,
            &server_challenge,
            &start.client_challenge,
        )
        .unwrap();
    assert_eq!(response.id, request.id);

    // Client verifies the server signed the challenge the client generated.
    assert!(client.verify_body_part(&response, client_challenge.as_bytes(), &server_key));
    assert!(!client.verify_body_part(&response, &[0xAB; CHALLENGE_SIZE], &server_key));
}

#[test]
fn test_verify_identity_request_signature() {
    let client = signing_builder();
    let challenge = Challenge::generate();
    let request = client.create_verify_identity_request(challenge.as_bytes()).unwrap();
    let body = VerifyIdentityRequest {
        challenge: challenge.to_vec(),
    };
    let key = client.identity().unwrap().public_key_bytes();
    assert!(client.verify_body(&request, &body, &key));

    let wrong = VerifyIdentityRequest {
        challenge: Challenge::generate().to_vec(),
    };
    assert!(!client.verify_body(&request, &wrong, &key));
}
