//! Authenticated WebTransport connections.

use std::sync::Arc;

use bytes::Bytes;
use libp2p::PeerId;
use multiaddr::Multiaddr;
use web_transport_quinn::{RecvStream, SendStream, Session, SessionError};

use crate::{
    defaults::close_codes,
    policy::{Direction, ScopeGuard},
};

/// A WebTransport session whose remote peer has been authenticated.
///
/// Cloning a connection gives another handle to the same session. The session
/// is closed when [`Connection::close`] is called or when all handles and
/// streams are dropped. The resource scope of the connection is released at
/// the same time.
#[derive(Debug, Clone)]
pub struct Connection {
    session: Session,
    local_peer: PeerId,
    remote_peer: PeerId,
    local_multiaddr: Multiaddr,
    remote_multiaddr: Multiaddr,
    direction: Direction,
    scope: Arc<ScopeGuard>,
    /// The client endpoint of an outbound connection, which must outlive the session.
    _endpoint: Option<quinn::Endpoint>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: Session,
        local_peer: PeerId,
        remote_peer: PeerId,
        local_multiaddr: Multiaddr,
        remote_multiaddr: Multiaddr,
        direction: Direction,
        scope: ScopeGuard,
        endpoint: Option<quinn::Endpoint>,
    ) -> Self {
        Self {
            session,
            local_peer,
            remote_peer,
            local_multiaddr,
            remote_multiaddr,
            direction,
            scope: Arc::new(scope),
            _endpoint: endpoint,
        }
    }

    /// Opens a bidirectional stream.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), SessionError> {
        self.session.open_bi().await
    }

    /// Waits for the remote to open a bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), SessionError> {
        self.session.clone().accept_bi().await
    }

    /// Opens a unidirectional stream.
    pub async fn open_uni(&self) -> Result<SendStream, SessionError> {
        self.session.open_uni().await
    }

    /// Waits for the remote to open a unidirectional stream.
    pub async fn accept_uni(&self) -> Result<RecvStream, SessionError> {
        self.session.clone().accept_uni().await
    }

    /// Sends an unreliable datagram.
    pub fn send_datagram(&self, data: Bytes) -> Result<(), SessionError> {
        self.session.send_datagram(data)
    }

    /// Receives the next datagram.
    pub async fn read_datagram(&self) -> Result<Bytes, SessionError> {
        self.session.read_datagram().await
    }

    /// Closes the session and releases its resources.
    pub fn close(&self, code: u32, reason: &[u8]) {
        self.session.close(code, reason);
        self.scope.release();
    }

    /// Waits until the session is closed, by either side.
    pub async fn closed(&self) -> SessionError {
        self.session.closed().await
    }

    /// Returns whether the session is closed.
    pub fn is_closed(&self) -> bool {
        self.session.close_reason().is_some()
    }

    /// Our peer id.
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// The authenticated peer id of the remote.
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Our address, without certificate hashes.
    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    /// The remote's address, without certificate hashes.
    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_multiaddr
    }

    /// Which side opened the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn reject(&self, code: u32, reason: &[u8]) {
        debug_assert_ne!(code, close_codes::NORMAL);
        self.close(code, reason);
    }
}
