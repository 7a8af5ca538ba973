//! Per-connection read/handle/reply loop.

use super::{wait_for_shutdown, MessageHandler};
use crate::peer::{PeerRegistry, Session};
use crate::protocol::{envelope, Message};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

/// Why a session loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionExit {
    /// The peer closed the stream between frames.
    PeerClosed,
    /// Reading failed, including a stream that ended inside a frame.
    ReadFailed,
    /// The peer sent an undecodable frame.
    ProtocolViolation,
    /// The handler asked to disconnect.
    HandlerClosed,
    /// Writing a response failed.
    WriteFailed,
    /// TLS handshake failed.
    TlsFailed,
    /// Closed from outside: eviction, idle sweep or manager shutdown.
    ForceClosed,
    /// The role server is stopping.
    Shutdown,
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionExit::PeerClosed => "peer closed",
            SessionExit::ReadFailed => "read failed",
            SessionExit::ProtocolViolation => "protocol violation",
            SessionExit::HandlerClosed => "handler closed",
            SessionExit::WriteFailed => "write failed",
            SessionExit::TlsFailed => "tls failed",
            SessionExit::ForceClosed => "force closed",
            SessionExit::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Drive one connection until it ends, then clean up.
///
/// Every exit path ends here: the session leaves the registry, its stream is
/// shut down and the handler's disconnect callback runs, once.
pub(crate) async fn run_session(
    stream: TcpStream,
    session: Arc<Session>,
    handler: Box<dyn MessageHandler>,
    registry: Arc<PeerRegistry>,
    tls: Option<TlsAcceptor>,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> SessionExit {
    let exit = match tls {
        None => serve(stream, &session, handler.as_ref(), max_frame_size, &mut shutdown).await,
        Some(acceptor) => {
            let handshake = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => Err(SessionExit::Shutdown),
                _ = session.closed() => Err(SessionExit::ForceClosed),
                result = acceptor.accept(stream) => result.map_err(|e| {
                    debug!(session = %session, error = %e, "TLS handshake failed");
                    SessionExit::TlsFailed
                }),
            };
            match handshake {
                Ok(stream) => {
                    serve(stream, &session, handler.as_ref(), max_frame_size, &mut shutdown).await
                }
                Err(exit) => exit,
            }
        }
    };

    registry.remove_peer(&session);
    session.close();
    session.shutdown_writer().await;
    handler.on_disconnect(&session).await;

    debug!(session = %session, exit = %exit, "Session ended");
    exit
}

async fn serve<S>(
    stream: S,
    session: &Arc<Session>,
    handler: &dyn MessageHandler,
    max_frame_size: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionExit
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    session.attach_writer(Box::new(writer)).await;

    loop {
        let read = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => return SessionExit::Shutdown,
            _ = session.closed() => return SessionExit::ForceClosed,
            read = envelope::read_message(&mut reader, max_frame_size) => read,
        };

        let message = match read {
            Ok(Some(message)) => message,
            Ok(None) => return SessionExit::PeerClosed,
            Err(e) if e.is_framing() => {
                // The stream is unsynchronized now; no way to find the next frame.
                warn!(session = %session, error = %e, "Malformed frame, closing connection");
                if let Some(response) = handler.protocol_violation() {
                    if let Err(exit) = send(session, &response, shutdown).await {
                        return exit;
                    }
                }
                return SessionExit::ProtocolViolation;
            }
            Err(e) => {
                debug!(session = %session, error = %e, "Read failed");
                return SessionExit::ReadFailed;
            }
        };

        trace!(session = %session, message = %message, "Message received");
        let is_request = message.is_request();
        let outcome = handler.process_message(session, message).await;

        if let Some(response) = outcome.response {
            if let Err(exit) = send(session, &response, shutdown).await {
                return exit;
            }
        }
        if is_request {
            session.refresh_keep_alive();
        }
        if !outcome.keep_open {
            return SessionExit::HandlerClosed;
        }
    }
}

/// Write one message unless the session is closed or the server stops
/// first. A peer that stopped reading must not pin the loop in a write.
async fn send(
    session: &Arc<Session>,
    message: &Message,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionExit> {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => Err(SessionExit::Shutdown),
        _ = session.closed() => Err(SessionExit::ForceClosed),
        sent = session.send(message) => sent.map_err(|e| {
            debug!(session = %session, error = %e, "Write failed");
            SessionExit::WriteFailed
        }),
    }
}
