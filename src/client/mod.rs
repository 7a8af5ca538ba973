//! Directory Client
//!
//! Outbound connection to the upstream location directory. It speaks the
//! same envelope and [`MessageBuilder`] as the role servers, using the
//! local-service request family:
//!
//! 1. [`connect`](DirectoryClient::connect) - retry until connected or shut down
//! 2. [`register_primary_service`](DirectoryClient::register_primary_service)
//!    announces this server and learns its location
//! 3. [`get_neighbourhood`](DirectoryClient::get_neighbourhood) fetches the
//!    initial neighbour set
//! 4. [`receive_message_loop`](DirectoryClient::receive_message_loop)
//!    handles neighbourhood updates pushed by the directory
//!
//! Every response is checked for id correlation, shape, status and
//! operation before its payload is returned.

use crate::config::DirectoryConfig;
use crate::protocol::{
    envelope, GpsLocation, LocalServiceResponse, Message, MessageBody, MessageBuilder, NodeInfo, ProtocolError,
    ResponseKind, SemVer, ServiceInfo, ServiceType, Status,
};
use crate::server::{wait_for_shutdown, HandlerOutcome};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod tests;

/// How long a request waits for its response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from directory client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to the directory")]
    NotConnected,

    #[error("shutdown requested")]
    ShuttingDown,

    #[error("directory closed the connection")]
    ConnectionClosed,

    #[error("directory did not respond in time")]
    Timeout,

    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u32, got: u32 },

    #[error("expected a {expected} response")]
    UnexpectedResponse { expected: &'static str },

    #[error("directory replied {status}")]
    Status { status: Status, details: Option<String> },

    #[error("directory provided invalid location {0}")]
    InvalidLocation(GpsLocation),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Handles messages the directory pushes outside a request/response pair.
#[async_trait]
pub trait DirectoryProcessor: Send + Sync {
    /// Process one message; the builder belongs to the client connection.
    async fn process_message(&self, builder: &MessageBuilder, message: Message) -> HandlerOutcome;
}

/// Client for the upstream location directory.
pub struct DirectoryClient {
    config: DirectoryConfig,
    service_type: ServiceType,
    builder: MessageBuilder,
    stream: Option<TcpStream>,
    /// Bytes of a frame not yet complete. Kept across cancelled reads.
    read_buf: Vec<u8>,
    max_frame_size: usize,
    shutdown: watch::Receiver<bool>,
}

impl DirectoryClient {
    /// Create a disconnected client announcing services of `service_type`.
    pub fn new(config: DirectoryConfig, service_type: ServiceType, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            service_type,
            builder: MessageBuilder::new(0, vec![SemVer::V100], None),
            stream: None,
            read_buf: Vec::new(),
            max_frame_size: envelope::DEFAULT_MAX_FRAME_SIZE,
            shutdown,
        }
    }

    pub fn builder(&self) -> &MessageBuilder {
        &self.builder
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connect to the directory, retrying every `retry_interval` until a
    /// connection is made or shutdown is signalled.
    ///
    /// Any previous connection is dropped first.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.drop_connection();
        let retry_interval = self.config.retry_interval();

        loop {
            if self.is_shutting_down() {
                return Err(ClientError::ShuttingDown);
            }

            trace!(addr = %self.config.addr, "Connecting to directory");
            let connected = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return Err(ClientError::ShuttingDown),
                connected = TcpStream::connect(self.config.addr.as_str()) => connected,
            };

            match connected {
                Ok(stream) => {
                    info!(addr = %self.config.addr, "Connected to directory");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        addr = %self.config.addr,
                        error = %e,
                        retry_secs = retry_interval.as_secs(),
                        "Unable to connect to directory, retrying"
                    );
                    self.wait_retry().await?;
                }
            }
        }
    }

    /// Sleep for the retry interval unless shutdown is signalled first.
    pub async fn wait_retry(&mut self) -> Result<(), ClientError> {
        tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => Err(ClientError::ShuttingDown),
            _ = tokio::time::sleep(self.config.retry_interval()) => Ok(()),
        }
    }

    /// Drop the connection.
    pub fn disconnect(&mut self) {
        if self.stream.is_some() {
            debug!(addr = %self.config.addr, "Disconnected from directory");
        }
        self.drop_connection();
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.read_buf.clear();
    }

    /// Write one message. A write failure drops the connection.
    pub async fn send_message(&mut self, message: &Message) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        if let Err(e) = envelope::write_message(stream, message).await {
            warn!(addr = %self.config.addr, error = %e, "Send to directory failed");
            self.drop_connection();
            return Err(e.into());
        }
        Ok(())
    }

    /// Read one message, giving up when shutdown is signalled.
    ///
    /// Returns `Ok(None)` when the directory closed the connection. With
    /// `check_protocol_violation`, an undecodable frame is answered with a
    /// protocol violation response before the connection is dropped.
    ///
    /// Cancel-safe: a partially received frame stays buffered, so the
    /// connection can still be used for a later request.
    pub async fn receive_message(&mut self, check_protocol_violation: bool) -> Result<Option<Message>, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let received = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => return Err(ClientError::ShuttingDown),
            received = read_buffered(stream, &mut self.read_buf, self.max_frame_size) => received,
        };
        self.settle(received, check_protocol_violation).await
    }

    /// Read the response to `request`, ignoring shutdown so that a final
    /// deregistration can complete. Requests pushed by the directory in the
    /// meantime are skipped.
    async fn receive_response(&mut self, request: &Message) -> Result<Message, ClientError> {
        let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
            let read = read_buffered(stream, &mut self.read_buf, self.max_frame_size);
            let Ok(received) = tokio::time::timeout_at(deadline, read).await else {
                warn!(addr = %self.config.addr, id = request.id, "Directory response timed out");
                self.drop_connection();
                return Err(ClientError::Timeout);
            };

            let message = self.settle(received, false).await?.ok_or(ClientError::ConnectionClosed)?;
            if message.request().is_some() {
                debug!(id = message.id, "Skipping directory request while awaiting a response");
                continue;
            }
            return Ok(message);
        }
    }

    /// Drop the connection on anything but a decoded message.
    async fn settle(
        &mut self,
        received: Result<Option<Message>, ProtocolError>,
        check_protocol_violation: bool,
    ) -> Result<Option<Message>, ClientError> {
        match received {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                debug!(addr = %self.config.addr, "Directory closed the connection");
                self.drop_connection();
                Ok(None)
            }
            Err(e) => {
                if e.is_framing() {
                    warn!(addr = %self.config.addr, error = %e, "Invalid message from directory");
                    if check_protocol_violation {
                        let violation = self.builder.create_error_protocol_violation_response(None);
                        // The connection is dropped either way.
                        let _ = self.send_message(&violation).await;
                    }
                }
                self.drop_connection();
                Err(e.into())
            }
        }
    }

    /// Announce the primary port. Returns the location the directory
    /// assigned to this server.
    pub async fn register_primary_service(&mut self, port: u16, service_data: Vec<u8>) -> Result<GpsLocation, ClientError> {
        let request = self.builder.create_register_service_request(ServiceInfo {
            service_type: self.service_type,
            port,
            service_data,
        });

        match self.call(request).await? {
            LocalServiceResponse::RegisterService(registered) => {
                let location = registered.location;
                if !location.is_valid() {
                    error!(location = %location, "Directory provided invalid location");
                    return Err(ClientError::InvalidLocation(location));
                }
                info!(port, location = %location, "Primary service registered with directory");
                Ok(location)
            }
            _ => Err(ClientError::UnexpectedResponse {
                expected: "register service",
            }),
        }
    }

    /// Withdraw the primary port registration.
    pub async fn deregister_primary_service(&mut self) -> Result<(), ClientError> {
        let request = self.builder.create_deregister_service_request(self.service_type);
        match self.call(request).await? {
            LocalServiceResponse::DeregisterService(_) => {
                info!("Primary service deregistered from directory");
                Ok(())
            }
            _ => Err(ClientError::UnexpectedResponse {
                expected: "deregister service",
            }),
        }
    }

    /// Fetch the current neighbourhood and subscribe to its changes on this
    /// connection.
    pub async fn get_neighbourhood(&mut self) -> Result<Vec<NodeInfo>, ClientError> {
        let request = self.builder.create_get_neighbour_nodes_request(true);
        match self.call(request).await? {
            LocalServiceResponse::GetNeighbourNodes(neighbours) => {
                debug!(count = neighbours.nodes.len(), "Neighbourhood received from directory");
                Ok(neighbours.nodes)
            }
            _ => Err(ClientError::UnexpectedResponse {
                expected: "get neighbour nodes",
            }),
        }
    }

    /// Hand incoming messages to `processor` until the directory disconnects,
    /// the processor asks to stop, or shutdown is signalled.
    pub async fn receive_message_loop(&mut self, processor: &dyn DirectoryProcessor) -> Result<(), ClientError> {
        loop {
            let message = match self.receive_message(true).await {
                Ok(Some(message)) => message,
                Ok(None) | Err(ClientError::ShuttingDown) => return Ok(()),
                Err(e) => return Err(e),
            };

            let outcome = processor.process_message(&self.builder, message).await;
            if let Some(response) = outcome.response {
                self.send_message(&response).await?;
            }
            if !outcome.keep_open {
                self.disconnect();
                return Ok(());
            }
        }
    }

    /// Send a local-service request and return its checked response.
    async fn call(&mut self, request: Message) -> Result<LocalServiceResponse, ClientError> {
        self.send_message(&request).await?;
        let response = self.receive_response(&request).await?;
        local_service_response(&request, response)
    }
}

/// Read until `buf` holds a whole frame and split it off.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
async fn read_buffered(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    max_frame_size: usize,
) -> Result<Option<Message>, ProtocolError> {
    loop {
        if let Some(message) = envelope::take_message(buf, max_frame_size)? {
            return Ok(Some(message));
        }
        buf.reserve(4096);
        if stream.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
}

/// Check correlation, shape and status of a local-service response.
fn local_service_response(request: &Message, response: Message) -> Result<LocalServiceResponse, ClientError> {
    if response.id != request.id {
        return Err(ClientError::IdMismatch {
            expected: request.id,
            got: response.id,
        });
    }
    let MessageBody::Response(response) = response.body else {
        return Err(ClientError::UnexpectedResponse { expected: "response" });
    };
    if !response.status.is_ok() {
        error!(status = %response.status, details = ?response.details, "Directory request failed");
        return Err(ClientError::Status {
            status: response.status,
            details: response.details,
        });
    }
    match response.kind {
        Some(ResponseKind::LocalService(local)) => Ok(local),
        _ => Err(ClientError::UnexpectedResponse {
            expected: "local service",
        }),
    }
}
