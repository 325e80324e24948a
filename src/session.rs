//! Per-connection WebSocket session.
//!
//! A session drives one accepted socket through the opening handshake,
//! then alternates between reading one whole message and writing it back
//! until the peer closes or an error occurs. Reads and writes strictly
//! alternate, so a slow peer only ever stalls its own session.

use crate::config::SessionConfig;
use crate::message::{echo_reply, FrameKind, Inbound};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SERVER};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// Value of the `Server` header sent with the handshake response.
pub const SERVER_HEADER: &str = concat!(
    "websocket-server-async/",
    env!("CARGO_PKG_VERSION"),
    " tokio-tungstenite"
);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, handshake not yet complete.
    Created,
    /// Waiting for the next whole message.
    Reading,
    /// Echoing the message held in the buffer.
    Writing,
    /// Stream released.
    Closed,
}

/// Keeps the listener's live-session count accurate for as long as the
/// session exists.
#[derive(Debug)]
pub struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    pub fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { live }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One accepted connection.
pub struct Session {
    peer: SocketAddr,
    config: Arc<SessionConfig>,
    state: SessionState,
    /// Payload of the message currently being echoed.
    buffer: Vec<u8>,
    _live: LiveGuard,
}

impl Session {
    pub fn new(peer: SocketAddr, config: Arc<SessionConfig>, live: LiveGuard) -> Self {
        Self {
            peer,
            config,
            state: SessionState::Created,
            buffer: Vec::new(),
            _live: live,
        }
    }

    /// Drive the session to completion, reporting any failure.
    ///
    /// Intended to be the whole body of the session's task; the session and
    /// its stream are dropped when this returns.
    pub async fn run(mut self, socket: TcpStream) {
        match self.drive(socket).await {
            Ok(()) => debug!(peer = %self.peer, "Connection closed by peer"),
            Err(e) => warn!(
                op = e.op(),
                stage = "session",
                peer = %self.peer,
                error = %e,
                "Session failed"
            ),
        }
        self.transition(SessionState::Closed);
    }

    async fn drive(&mut self, socket: TcpStream) -> Result<(), SessionError> {
        let mut ws = self.handshake(socket).await?;

        loop {
            self.transition(SessionState::Reading);
            let Some(kind) = self.read(&mut ws).await? else {
                return Ok(());
            };

            self.transition(SessionState::Writing);
            self.write(&mut ws, kind).await?;
        }
    }

    async fn handshake(
        &mut self,
        socket: TcpStream,
    ) -> Result<WebSocketStream<TcpStream>, SessionError> {
        let mut ws_config = WebSocketConfig::default();
        if let Some(max) = self.config.max_message_size {
            ws_config.max_message_size = Some(max);
        }
        if let Some(max) = self.config.max_frame_size {
            ws_config.max_frame_size = Some(max);
        }

        let accept = tokio_tungstenite::accept_hdr_async_with_config(
            socket,
            decorate_response,
            Some(ws_config),
        );

        match timeout(self.config.handshake_timeout, accept).await {
            Ok(Ok(ws)) => Ok(ws),
            Ok(Err(e)) => Err(SessionError::Handshake(e)),
            Err(_) => Err(SessionError::HandshakeTimeout),
        }
    }

    /// Read until a whole data message is in the buffer.
    ///
    /// Returns `None` once the peer has closed the connection.
    async fn read(
        &mut self,
        ws: &mut WebSocketStream<TcpStream>,
    ) -> Result<Option<FrameKind>, SessionError> {
        debug_assert!(self.buffer.is_empty());

        loop {
            let message = match with_idle_timeout(self.config.idle_timeout, ws.next()).await {
                Some(Some(Ok(message))) => message,
                Some(None) => return Ok(None),
                Some(Some(Err(e))) if is_peer_close(&e) => return Ok(None),
                Some(Some(Err(e))) => return Err(SessionError::Read(e)),
                None => return Err(SessionError::ReadTimeout),
            };

            match Inbound::classify(message) {
                Inbound::Data { kind, payload } => {
                    trace!(peer = %self.peer, ?kind, len = payload.len(), "Message received");
                    self.buffer = payload;
                    return Ok(Some(kind));
                }
                // Keep reading so queued pongs and the close reply get flushed.
                Inbound::Control | Inbound::Close => continue,
            }
        }
    }

    /// Echo the buffered message with the classification it arrived with.
    async fn write(
        &mut self,
        ws: &mut WebSocketStream<TcpStream>,
        kind: FrameKind,
    ) -> Result<(), SessionError> {
        let payload = std::mem::take(&mut self.buffer);
        let reply = echo_reply(kind, payload).map_err(|_| SessionError::Encoding)?;

        match with_idle_timeout(self.config.idle_timeout, ws.send(reply)).await {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(SessionError::Write(e)),
            None => Err(SessionError::WriteTimeout),
        }
    }

    fn transition(&mut self, next: SessionState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Session state");
        if next == SessionState::Closed {
            self.buffer = Vec::new();
        }
        self.state = next;
    }
}

/// Handshake callback adding the `Server` header to the upgrade response.
fn decorate_response(_request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static(SERVER_HEADER));
    Ok(response)
}

/// Run `op` under the idle limit. `None` means the limit elapsed.
async fn with_idle_timeout<F: Future>(limit: Option<Duration>, op: F) -> Option<F::Output> {
    match limit {
        Some(limit) => timeout(limit, op).await.ok(),
        None => Some(op.await),
    }
}

/// Errors that mean the connection ended in an orderly way: a completed
/// closing handshake, or EOF between messages.
///
/// A reset (`Io` with ECONNRESET) stays an error.
fn is_peer_close(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

/// Reasons a session ends other than an orderly close by the peer.
#[derive(Debug)]
pub enum SessionError {
    Handshake(WsError),
    HandshakeTimeout,
    Read(WsError),
    Write(WsError),
    /// No message arrived within the idle limit.
    ReadTimeout,
    /// The peer stopped draining its socket for longer than the idle limit.
    WriteTimeout,
    /// A text payload was no longer valid UTF-8 when echoed.
    Encoding,
}

impl SessionError {
    /// Short tag naming the operation that failed.
    pub fn op(&self) -> &'static str {
        match self {
            SessionError::Handshake(_) | SessionError::HandshakeTimeout => "accept",
            SessionError::Read(_) | SessionError::ReadTimeout => "read",
            SessionError::Write(_) | SessionError::WriteTimeout | SessionError::Encoding => {
                "write"
            }
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Handshake(e) => write!(f, "handshake failed: {e}"),
            SessionError::HandshakeTimeout => write!(f, "handshake timed out"),
            SessionError::Read(e) => write!(f, "read failed: {e}"),
            SessionError::Write(e) => write!(f, "write failed: {e}"),
            SessionError::ReadTimeout => write!(f, "read timed out"),
            SessionError::WriteTimeout => write!(f, "write timed out"),
            SessionError::Encoding => write!(f, "text payload is not valid UTF-8"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Handshake(e) | SessionError::Read(e) | SessionError::Write(e) => Some(e),
            _ => None,
        }
    }
}
