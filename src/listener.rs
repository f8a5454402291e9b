//! Accepting WebTransport connections.
//!
//! A [`Listener`] owns a QUIC endpoint and a background task accepting
//! sessions on it. Every session goes through the same pipeline, in its own
//! task:
//!
//! 1. QUIC handshake and WebTransport `CONNECT` request, each bounded by the
//!    handshake timeout. Requests for another path are answered with `404`,
//!    requests without `?type=noise` with `400`.
//! 2. [`ConnectionGater::intercept_accept`], `403` on rejection.
//! 3. [`ResourceManager::open_connection`], `503` on denial.
//! 4. Admission: at most [`ACCEPT_QUEUE_LEN`] sessions may be between the
//!    upgrade and the accept queue at the same time, others get `503`.
//! 5. The noise handshake, bounded by the handshake timeout.
//! 6. [`ConnectionScope::set_peer`] and [`ConnectionGater::intercept_secured`].
//! 7. The accept queue. If it is full, the session is closed.
//!
//! At most [`MAX_PENDING_SESSIONS`] sessions are in this pipeline at the same
//! time, further QUIC connections are refused.
//!
//! Failures along the way close the session and are only logged, so
//! [`Listener::accept`] only ever sees authenticated connections.
//!
//! [`ConnectionGater::intercept_accept`]: crate::ConnectionGater::intercept_accept
//! [`ConnectionGater::intercept_secured`]: crate::ConnectionGater::intercept_secured
//! [`ResourceManager::open_connection`]: crate::ResourceManager::open_connection
//! [`ConnectionScope::set_peer`]: crate::ConnectionScope::set_peer

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use http::StatusCode;
use multiaddr::Multiaddr;
use n0_future::{
    task::{self, AbortOnDropHandle},
    time,
};
use nested_enum_utils::common_fields;
use snafu::{ResultExt, Snafu};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};
use web_transport_quinn::Request;

use crate::{
    addr::{self, CertHash},
    cert_manager::CertManager,
    connection::Connection,
    defaults::{
        ACCEPT_QUEUE_LEN, MAX_PENDING_SESSIONS, NOISE_QUERY_TYPE, WEBTRANSPORT_HTTP_ENDPOINT,
        close_codes,
    },
    handshake::{HandshakeError, Handshaker},
    metrics::Metrics,
    policy::{
        ConnMultiaddrs, Direction, DynConnectionGater, DynResourceManager, ScopeGuard,
    },
};

/// Error returned by [`Listener::accept`].
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AcceptError {
    #[snafu(display("listener closed"))]
    Closed {},
}

/// Error returned by [`Listener::close`].
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CloseError {
    #[snafu(display("the accept loop failed"))]
    Serve { source: tokio::task::JoinError },
}

/// Everything a session task needs, shared between all of them.
#[derive(Debug)]
pub(crate) struct SessionContext {
    pub(crate) local_multiaddr: Multiaddr,
    pub(crate) handshaker: Handshaker,
    pub(crate) gater: Option<Arc<dyn DynConnectionGater>>,
    pub(crate) resource_manager: Arc<dyn DynResourceManager>,
    pub(crate) cert_manager: Option<Arc<CertManager>>,
    pub(crate) metrics: Arc<Metrics>,
}

/// Accepts authenticated WebTransport connections.
///
/// Created by [`Transport::listen`]. Dropping the listener stops accepting and
/// closes the endpoint, like [`Listener::close`].
///
/// [`Transport::listen`]: crate::Transport::listen
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    local_multiaddr: Multiaddr,
    cert_manager: Option<Arc<CertManager>>,
    endpoint: quinn::Endpoint,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    cancel: CancellationToken,
    serve_task: Mutex<Option<AbortOnDropHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl Listener {
    pub(crate) fn spawn(
        endpoint: quinn::Endpoint,
        ctx: SessionContext,
    ) -> Result<Self, std::io::Error> {
        let local_addr = endpoint.local_addr()?;
        let (queue, incoming) = mpsc::channel(ACCEPT_QUEUE_LEN);
        let cancel = CancellationToken::new();
        let local_multiaddr = ctx.local_multiaddr.clone();
        let cert_manager = ctx.cert_manager.clone();
        let metrics = ctx.metrics.clone();

        let accept_loop = AcceptLoop {
            endpoint: endpoint.clone(),
            ctx: Arc::new(ctx),
            queue,
            half_open: Arc::new(Semaphore::new(ACCEPT_QUEUE_LEN)),
            cancel: cancel.clone(),
        };
        let serve_task = task::spawn(
            accept_loop
                .run()
                .instrument(info_span!("wt-listener", %local_addr)),
        );

        Ok(Self {
            local_addr,
            local_multiaddr,
            cert_manager,
            endpoint,
            incoming: tokio::sync::Mutex::new(incoming),
            cancel,
            serve_task: Mutex::new(Some(AbortOnDropHandle::new(serve_task))),
            metrics,
        })
    }

    /// Waits for the next authenticated connection.
    ///
    /// Fails with [`AcceptError::Closed`] once the listener is closed.
    pub async fn accept(&self) -> Result<Connection, AcceptError> {
        let conn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            conn = async { self.incoming.lock().await.recv().await } => conn,
        };
        let conn = conn.ok_or_else(|| ClosedSnafu.build())?;
        self.metrics.connections_accepted.inc();
        trace!(remote = %conn.remote_peer(), "accepted connection");
        Ok(conn)
    }

    /// The socket the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address to publish for this listener.
    ///
    /// Contains the hashes of the certificates currently in rotation, unless
    /// the transport serves a static TLS config.
    pub fn multiaddr(&self) -> Multiaddr {
        let mut addr = self.local_multiaddr.clone();
        if let Some(cert_manager) = &self.cert_manager {
            for component in cert_manager.addr_components() {
                addr.push(component);
            }
        }
        addr
    }

    /// Stops accepting, closes the endpoint and waits for the accept loop to finish.
    ///
    /// Pending and future [`Listener::accept`] calls fail with [`AcceptError::Closed`].
    pub async fn close(&self) -> Result<(), CloseError> {
        self.cancel.cancel();
        self.endpoint
            .close(close_codes::NORMAL.into(), b"listener closed");
        let task = self.serve_task.lock().expect("poisoned").take();
        if let Some(task) = task {
            task.await.context(ServeSnafu)?;
        }
        debug!(addr = %self.local_addr, "listener closed");
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.endpoint
            .close(close_codes::NORMAL.into(), b"listener closed");
    }
}

struct AcceptLoop {
    endpoint: quinn::Endpoint,
    ctx: Arc<SessionContext>,
    queue: mpsc::Sender<Connection>,
    half_open: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        let mut set = task::JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    break;
                }
                Some(res) = set.join_next(), if !set.is_empty() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            panic!("session task panicked: {err:#?}");
                        }
                    }
                }
                res = self.endpoint.accept() => match res {
                    Some(incoming) if set.len() >= MAX_PENDING_SESSIONS => {
                        debug!(
                            remote_addr = %incoming.remote_address(),
                            "too many sessions being set up, refusing"
                        );
                        self.ctx.metrics.sessions_refused.inc();
                        incoming.refuse();
                    }
                    Some(incoming) => {
                        let remote_addr = incoming.remote_address();
                        trace!(%remote_addr, "incoming session");
                        let session = SessionTask {
                            ctx: self.ctx.clone(),
                            queue: self.queue.clone(),
                            half_open: self.half_open.clone(),
                            remote_addr,
                        };
                        let cancel = self.cancel.child_token();
                        set.spawn(
                            async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {
                                        trace!("listener closed during setup");
                                    }
                                    _ = session.run(incoming) => {}
                                }
                            }
                            .instrument(info_span!("wt-session", %remote_addr)),
                        );
                    }
                    None => {
                        debug!("endpoint closed");
                        break;
                    }
                }
            }
        }
        set.shutdown().await;
    }
}

/// Sets up a single inbound session.
struct SessionTask {
    ctx: Arc<SessionContext>,
    queue: mpsc::Sender<Connection>,
    half_open: Arc<Semaphore>,
    remote_addr: SocketAddr,
}

impl SessionTask {
    async fn run(self, incoming: quinn::Incoming) {
        let timeout = self.ctx.handshaker.timeout();
        let conn = match time::timeout(timeout, incoming).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                debug!("QUIC handshake failed: {err:#}");
                return;
            }
            Err(_) => {
                debug!("QUIC handshake timed out");
                self.ctx.metrics.sessions_timed_out.inc();
                return;
            }
        };
        let accept = web_transport_quinn::accept(conn.clone());
        let request = match time::timeout(timeout, accept).await {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                debug!("invalid WebTransport request: {err:#}");
                conn.close(close_codes::HANDSHAKE_FAILED.into(), b"invalid request");
                return;
            }
            Err(_) => {
                debug!("no WebTransport request in time");
                self.ctx.metrics.sessions_timed_out.inc();
                conn.close(close_codes::HANDSHAKE_FAILED.into(), b"request timed out");
                return;
            }
        };
        self.handle_request(request).await;
    }

    async fn handle_request(self, request: Request) {
        let metrics = &self.ctx.metrics;
        metrics.sessions_received.inc();

        let url = request.url();
        if url.path() != WEBTRANSPORT_HTTP_ENDPOINT {
            debug!(path = url.path(), "unexpected request path");
            metrics.sessions_rejected_bad_request.inc();
            return reject(request, StatusCode::NOT_FOUND).await;
        }
        if !url
            .query_pairs()
            .any(|(key, value)| key == "type" && value == NOISE_QUERY_TYPE)
        {
            debug!(query = ?url.query(), "unsupported handshake type");
            metrics.sessions_rejected_bad_request.inc();
            return reject(request, StatusCode::BAD_REQUEST).await;
        }

        let addrs = ConnMultiaddrs {
            local: self.ctx.local_multiaddr.clone(),
            remote: addr::socket_addr_to_webtransport_multiaddr(self.remote_addr),
        };
        if let Some(gater) = &self.ctx.gater {
            if !gater.intercept_accept(&addrs).await {
                debug!("gater refused the session");
                metrics.sessions_rejected_gated.inc();
                return reject(request, StatusCode::FORBIDDEN).await;
            }
        }

        let scope = match self
            .ctx
            .resource_manager
            .open_connection(Direction::Inbound, false, &addrs.remote)
            .await
        {
            Ok(scope) => ScopeGuard::new(scope),
            Err(err) => {
                debug!("resource manager refused the session: {err}");
                metrics.sessions_rejected_resources.inc();
                return reject(request, StatusCode::SERVICE_UNAVAILABLE).await;
            }
        };

        let Ok(_permit) = self.half_open.clone().try_acquire_owned() else {
            debug!("too many sessions in the handshake");
            metrics.sessions_rejected_busy.inc();
            return reject(request, StatusCode::SERVICE_UNAVAILABLE).await;
        };

        let session = match request.ok().await {
            Ok(session) => session,
            Err(err) => {
                debug!("failed to answer the WebTransport request: {err:#}");
                return;
            }
        };

        let peer = match self
            .ctx
            .handshaker
            .secure_inbound(&session, self.reported_hashes())
            .await
        {
            Ok(peer) => peer,
            Err(err) => {
                if matches!(err, HandshakeError::Timeout { .. }) {
                    metrics.handshakes_timed_out.inc();
                } else {
                    metrics.handshakes_failed.inc();
                }
                debug!("noise handshake failed: {err:#}");
                session.close(close_codes::HANDSHAKE_FAILED, b"handshake failed");
                return;
            }
        };

        if let Err(err) = scope.set_peer(peer) {
            debug!(%peer, "resource manager refused the peer: {err}");
            metrics.connections_rejected.inc();
            session.close(close_codes::RESOURCE_DENIED, b"resource limit exceeded");
            return;
        }
        if let Some(gater) = &self.ctx.gater {
            if !gater
                .intercept_secured(Direction::Inbound, peer, &addrs)
                .await
            {
                debug!(%peer, "gater refused the secured connection");
                metrics.connections_rejected.inc();
                session.close(close_codes::GATED, b"gated");
                return;
            }
        }

        let conn = Connection::new(
            session,
            self.ctx.handshaker.local_peer(),
            peer,
            addrs.local,
            addrs.remote,
            Direction::Inbound,
            scope,
            None,
        );
        match self.queue.try_send(conn) {
            Ok(()) => trace!(%peer, "queued connection"),
            Err(mpsc::error::TrySendError::Full(conn)) => {
                warn!(%peer, "accept queue full, dropping connection");
                metrics.accept_queue_overflow.inc();
                conn.reject(close_codes::ACCEPT_QUEUE_FULL, b"accept queue full");
            }
            Err(mpsc::error::TrySendError::Closed(conn)) => {
                conn.close(close_codes::NORMAL, b"listener closed");
            }
        }
    }

    /// The hashes reported to dialers in the noise handshake.
    fn reported_hashes(&self) -> HashSet<CertHash> {
        match &self.ctx.cert_manager {
            Some(cert_manager) => cert_manager.reported_hashes(),
            None => HashSet::new(),
        }
    }
}

async fn reject(request: Request, status: StatusCode) {
    if let Err(err) = request.close(status).await {
        debug!(%status, "failed to reject the session: {err:#}");
    }
}
