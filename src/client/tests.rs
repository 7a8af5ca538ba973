use super::*;
use crate::protocol::{LocalServiceRequest, NeighbourhoodChange, RequestKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Accept one connection and answer every request with `respond`.
/// Returns the requests seen once the client hangs up.
async fn directory_stub<F>(respond: F) -> (SocketAddr, JoinHandle<Vec<Message>>)
where
    F: Fn(&MessageBuilder, &Message) -> Option<Message> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let builder = MessageBuilder::new(0, vec![SemVer::V100], None);
        let mut seen = Vec::new();
        while let Ok(Some(message)) = envelope::read_message(&mut stream, envelope::DEFAULT_MAX_FRAME_SIZE).await {
            if let Some(response) = respond(&builder, &message) {
                envelope::write_message(&mut stream, &response).await.unwrap();
            }
            seen.push(message);
        }
        seen
    });
    (addr, task)
}

fn client_for(addr: SocketAddr) -> (DirectoryClient, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let client = DirectoryClient::new(DirectoryConfig::new(addr.to_string()), ServiceType::Profile, rx);
    (client, tx)
}

fn local_request(message: &Message) -> &LocalServiceRequest {
    match &message.request().unwrap().kind {
        RequestKind::LocalService(local) => local,
        other => panic!("unexpected request {:?}", other),
    }
}

#[tokio::test]
async fn test_register_primary_service() {
    let (addr, stub) = directory_stub(|builder, request| {
        Some(builder.create_register_service_response(request, GpsLocation::from_degrees(50.0755, 14.4378)))
    })
    .await;
    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();

    let location = client.register_primary_service(16987, vec![1, 2, 3]).await.unwrap();
    assert_eq!(location, GpsLocation::new(50_075_500, 14_437_800));

    client.disconnect();
    let seen = stub.await.unwrap();
    assert_eq!(seen.len(), 1);
    match local_request(&seen[0]) {
        LocalServiceRequest::RegisterService(register) => {
            assert_eq!(register.service.service_type, ServiceType::Profile);
            assert_eq!(register.service.port, 16987);
            assert_eq!(register.service.service_data, vec![1, 2, 3]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_register_rejects_invalid_location() {
    let (addr, _stub) = directory_stub(|builder, request| {
        Some(builder.create_register_service_response(request, GpsLocation::new(91_000_000, 0)))
    })
    .await;
    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();

    assert!(matches!(
        client.register_primary_service(1, vec![]).await,
        Err(ClientError::InvalidLocation(_))
    ));
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let (addr, _stub) = directory_stub(|builder, request| {
        Some(builder.create_error_rejected_response(request, Some("full")))
    })
    .await;
    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();

    match client.deregister_primary_service().await {
        Err(ClientError::Status { status, details }) => {
            assert_eq!(status, Status::Rejected);
            assert_eq!(details.as_deref(), Some("full"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_id_mismatch_is_reported() {
    let (addr, _stub) = directory_stub(|builder, request| {
        let mut response = builder.create_deregister_service_response(request);
        response.id += 1;
        Some(response)
    })
    .await;
    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();

    match client.deregister_primary_service().await {
        Err(ClientError::IdMismatch { expected, got }) => assert_eq!(got, expected + 1),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_wrong_operation_is_reported() {
    let (addr, _stub) = directory_stub(|builder, request| Some(builder.create_deregister_service_response(request))).await;
    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();

    assert!(matches!(
        client.get_neighbourhood().await,
        Err(ClientError::UnexpectedResponse { .. })
    ));
}

#[tokio::test]
async fn test_neighbourhood_and_deregister() {
    let node = NodeInfo {
        node_id: vec![9; 32],
        ip_address: vec![127, 0, 0, 1],
        port: 16987,
        location: GpsLocation::from_degrees(1.0, 2.0),
        services: vec![],
    };
    let returned = node.clone();
    let (addr, stub) = directory_stub(move |builder, request| match local_request(request) {
        LocalServiceRequest::GetNeighbourNodes(get) => {
            assert!(get.keep_alive);
            Some(builder.create_get_neighbour_nodes_response(request, vec![returned.clone()]))
        }
        LocalServiceRequest::DeregisterService(_) => Some(builder.create_deregister_service_response(request)),
        _ => None,
    })
    .await;
    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();

    assert_eq!(client.get_neighbourhood().await.unwrap(), vec![node]);
    client.deregister_primary_service().await.unwrap();

    client.disconnect();
    assert_eq!(stub.await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_not_connected() {
    let (mut client, _shutdown) = client_for("127.0.0.1:1".parse().unwrap());
    let ping = client.builder().create_ping_request(vec![]);
    assert!(matches!(client.send_message(&ping).await, Err(ClientError::NotConnected)));
    assert!(matches!(client.receive_message(false).await, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn test_connect_stops_on_shutdown() {
    // Nothing listens on a port we just released.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (mut client, shutdown) = client_for(addr);

    let signal = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(true).unwrap();
        shutdown
    });

    let result = tokio::time::timeout(Duration::from_secs(5), client.connect()).await.unwrap();
    assert!(matches!(result, Err(ClientError::ShuttingDown)));
    assert!(!client.is_connected());
    drop(signal.await.unwrap());
}

#[tokio::test]
async fn test_receive_answers_garbage_with_protocol_violation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stub = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&3u32.to_be_bytes()).await.unwrap();
        stream.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        envelope::read_message(&mut stream, envelope::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap()
    });

    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();
    assert!(matches!(client.receive_message(true).await, Err(ClientError::Protocol(_))));
    assert!(!client.is_connected());

    let violation = stub.await.unwrap();
    assert_eq!(violation.id, 0);
    assert_eq!(violation.response().unwrap().status, Status::ProtocolViolation);
}

struct CountingProcessor {
    changes: AtomicUsize,
}

#[async_trait]
impl DirectoryProcessor for CountingProcessor {
    async fn process_message(&self, builder: &MessageBuilder, message: Message) -> HandlerOutcome {
        match message.request().map(|r| &r.kind) {
            Some(RequestKind::LocalService(LocalServiceRequest::NeighbourhoodChanged(changed))) => {
                self.changes.fetch_add(changed.changes.len(), Ordering::SeqCst);
                HandlerOutcome::reply(builder.create_neighbourhood_changed_response(&message))
            }
            _ => HandlerOutcome::close(),
        }
    }
}

#[tokio::test]
async fn test_receive_message_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stub = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let builder = MessageBuilder::new(0, vec![SemVer::V100], None);
        let update = builder.create_neighbourhood_changed_request(vec![
            NeighbourhoodChange::Removed(vec![1; 32]),
            NeighbourhoodChange::Removed(vec![2; 32]),
        ]);
        envelope::write_message(&mut stream, &update).await.unwrap();
        let response = envelope::read_message(&mut stream, envelope::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id, update.id);
        response
    });

    let (mut client, _shutdown) = client_for(addr);
    client.connect().await.unwrap();
    let processor = Arc::new(CountingProcessor {
        changes: AtomicUsize::new(0),
    });

    // The stub hangs up after reading the response, which ends the loop.
    client.receive_message_loop(processor.as_ref()).await.unwrap();
    assert_eq!(processor.changes.load(Ordering::SeqCst), 2);
    assert!(!client.is_connected());
    assert!(stub.await.unwrap().response().unwrap().status.is_ok());
}

#[tokio::test]
async fn test_deregister_after_shutdown_mid_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (half_sent_tx, half_sent_rx) = tokio::sync::oneshot::channel();
    let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();
    let stub = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let builder = MessageBuilder::new(0, vec![SemVer::V100], None);
        let update = builder.create_neighbourhood_changed_request(vec![NeighbourhoodChange::Removed(vec![3; 32])]);
        let frame = envelope::encode(&update).unwrap();
        let (head, tail) = frame.split_at(frame.len() / 2);

        stream.write_all(head).await.unwrap();
        half_sent_tx.send(()).unwrap();
        resume_rx.await.unwrap();
        stream.write_all(tail).await.unwrap();

        let request = envelope::read_message(&mut stream, envelope::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(local_request(&request), LocalServiceRequest::DeregisterService(_)));
        let response = builder.create_deregister_service_response(&request);
        envelope::write_message(&mut stream, &response).await.unwrap();
    });

    let (mut client, shutdown) = client_for(addr);
    client.connect().await.unwrap();
    let processor = CountingProcessor {
        changes: AtomicUsize::new(0),
    };

    let signal = async {
        half_sent_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(client.receive_message_loop(&processor), signal);
    result.unwrap();
    assert!(client.is_shutting_down());
    assert!(client.is_connected());
    assert_eq!(processor.changes.load(Ordering::SeqCst), 0);

    resume_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.deregister_primary_service())
        .await
        .unwrap()
        .unwrap();
    stub.await.unwrap();
}
