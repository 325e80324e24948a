//! TCP listener producing one session per accepted connection.
//!
//! The acceptor is set up step by step (open, SO_REUSEADDR, bind, listen)
//! so a failure can be reported with the step that caused it. A listener
//! whose setup failed stays inert: `start()` does nothing.

use crate::config::SessionConfig;
use crate::runtime::RuntimeHandle;
use crate::session::{LiveGuard, Session};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Pause before re-arming the accept after running out of descriptors or memory.
const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts connections and hands each one to a new session.
pub struct Listener {
    runtime: RuntimeHandle,
    acceptor: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    session_config: Arc<SessionConfig>,
    live: Arc<AtomicUsize>,
}

impl Listener {
    /// Create a listener bound to `endpoint`.
    ///
    /// A setup failure is logged with the failing step and leaves the
    /// listener inert; check [`Listener::is_open`].
    pub fn new(runtime: RuntimeHandle, endpoint: SocketAddr, session_config: SessionConfig) -> Self {
        let acceptor = {
            let _guard = runtime.enter();
            match open_acceptor(endpoint) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    error!(
                        op = e.op(),
                        stage = "listener",
                        endpoint = %endpoint,
                        error = %e,
                        "Listener setup failed"
                    );
                    None
                }
            }
        };
        let local_addr = acceptor.as_ref().and_then(|a| a.local_addr().ok());

        Listener {
            runtime,
            acceptor,
            local_addr,
            session_config: Arc::new(session_config),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether setup succeeded and the accept loop has not been started yet.
    pub fn is_open(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Address the acceptor is bound to, if setup succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of sessions currently alive.
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Start the accept loop on its own serialization context and return.
    ///
    /// No-op on an inert listener or when the loop is already running.
    pub fn start(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };

        let accept_loop = AcceptLoop {
            acceptor,
            runtime: self.runtime.clone(),
            session_config: Arc::clone(&self.session_config),
            live: Arc::clone(&self.live),
        };
        self.runtime
            .make_serialization_context()
            .spawn(accept_loop.run());
    }
}

struct AcceptLoop {
    acceptor: TcpListener,
    runtime: RuntimeHandle,
    session_config: Arc<SessionConfig>,
    live: Arc<AtomicUsize>,
}

impl AcceptLoop {
    /// One accept outstanding at a time; re-armed after every completion
    /// until the acceptor itself becomes unusable.
    async fn run(self) {
        loop {
            match self.acceptor.accept().await {
                Ok((socket, peer)) => {
                    info!(peer = %peer, "Accepted connection");
                    let session = Session::new(
                        peer,
                        Arc::clone(&self.session_config),
                        LiveGuard::new(Arc::clone(&self.live)),
                    );
                    self.runtime
                        .make_serialization_context()
                        .spawn(session.run(socket));
                }
                Err(e) => match classify_accept_error(&e) {
                    AcceptFailure::Fatal => {
                        error!(
                            op = "accept",
                            stage = "listener",
                            error = %e,
                            "Acceptor unusable, stopping"
                        );
                        return;
                    }
                    AcceptFailure::Exhausted => {
                        error!(op = "accept", stage = "listener", error = %e, "Accept failed");
                        tokio::time::sleep(EXHAUSTION_BACKOFF).await;
                    }
                    AcceptFailure::Transient => {
                        error!(op = "accept", stage = "listener", error = %e, "Accept failed");
                    }
                },
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum AcceptFailure {
    /// The acceptor itself is broken; no further accept can succeed.
    Fatal,
    /// Out of descriptors or memory; retrying immediately would spin.
    Exhausted,
    /// Affects only the connection being accepted.
    Transient,
}

fn classify_accept_error(err: &io::Error) -> AcceptFailure {
    match err.raw_os_error() {
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP) => AcceptFailure::Fatal,
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => AcceptFailure::Exhausted,
        _ => AcceptFailure::Transient,
    }
}

/// Build the listening socket one step at a time.
fn open_acceptor(endpoint: SocketAddr) -> Result<TcpListener, ListenerError> {
    let socket = Socket::new(Domain::for_address(endpoint), Type::STREAM, Some(Protocol::TCP))
        .map_err(ListenerError::Open)?;

    socket
        .set_reuse_address(true)
        .map_err(ListenerError::SetOption)?;
    socket
        .set_nonblocking(true)
        .map_err(ListenerError::SetOption)?;
    socket
        .bind(&endpoint.into())
        .map_err(ListenerError::Bind)?;
    socket
        .listen(libc::SOMAXCONN)
        .map_err(ListenerError::Listen)?;

    TcpListener::from_std(socket.into()).map_err(ListenerError::Listen)
}

/// Listener setup errors, one per setup step.
#[derive(Debug)]
pub enum ListenerError {
    Open(io::Error),
    SetOption(io::Error),
    Bind(io::Error),
    Listen(io::Error),
}

impl ListenerError {
    /// Short tag naming the step that failed.
    pub fn op(&self) -> &'static str {
        match self {
            ListenerError::Open(_) => "open",
            ListenerError::SetOption(_) => "set_option",
            ListenerError::Bind(_) => "bind",
            ListenerError::Listen(_) => "listen",
        }
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Open(e)
            | ListenerError::SetOption(e)
            | ListenerError::Bind(e)
            | ListenerError::Listen(e) => write!(f, "{}: {}", self.op(), e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Open(e)
            | ListenerError::SetOption(e)
            | ListenerError::Bind(e)
            | ListenerError::Listen(e) => Some(e),
        }
    }
}
