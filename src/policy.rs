//! Connection gating and resource accounting hooks.
//!
//! Both hooks are consulted on the connection setup path of dials and
//! listeners:
//!
//! - A [`ConnectionGater`] may refuse an inbound session before the
//!   WebTransport upgrade and any connection once the remote peer is known.
//! - A [`ResourceManager`] opens a [`ConnectionScope`] for every connection and
//!   may deny it, either right away or once the remote peer is known.

use std::{
    fmt::Debug,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
};

use libp2p::PeerId;
use multiaddr::Multiaddr;
use snafu::Snafu;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Direction {
    /// The remote dialed us.
    #[display("inbound")]
    Inbound,
    /// We dialed the remote.
    #[display("outbound")]
    Outbound,
}

/// The local and remote address of a connection, without certificate hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnMultiaddrs {
    /// Our address.
    pub local: Multiaddr,
    /// The remote's address.
    pub remote: Multiaddr,
}

/// Decides which connections are allowed.
///
/// Use [`Builder::connection_gater`] to install a gater on a transport.
///
/// ## Notes to implementers
///
/// Gaters are stored on the transport, so never store a [`Transport`] on the
/// gater itself: this would create a reference counting loop.
///
/// [`Builder::connection_gater`]: crate::Builder::connection_gater
/// [`Transport`]: crate::Transport
pub trait ConnectionGater: Debug + Send + Sync {
    /// Intercepts an inbound session before the WebTransport upgrade.
    ///
    /// Rejected sessions are answered with `403 Forbidden`.
    fn intercept_accept<'a>(
        &'a self,
        _addrs: &'a ConnMultiaddrs,
    ) -> impl Future<Output = bool> + Send + 'a {
        async { true }
    }

    /// Intercepts a connection once the noise handshake authenticated the remote peer.
    ///
    /// Rejected connections are closed. For outbound connections the dial fails.
    fn intercept_secured<'a>(
        &'a self,
        _direction: Direction,
        _peer: PeerId,
        _addrs: &'a ConnMultiaddrs,
    ) -> impl Future<Output = bool> + Send + 'a {
        async { true }
    }
}

pub(crate) trait DynConnectionGater: Debug + Send + Sync {
    fn intercept_accept<'a>(&'a self, addrs: &'a ConnMultiaddrs) -> BoxFuture<'a, bool>;
    fn intercept_secured<'a>(
        &'a self,
        direction: Direction,
        peer: PeerId,
        addrs: &'a ConnMultiaddrs,
    ) -> BoxFuture<'a, bool>;
}

impl<T: ConnectionGater> DynConnectionGater for T {
    fn intercept_accept<'a>(&'a self, addrs: &'a ConnMultiaddrs) -> BoxFuture<'a, bool> {
        Box::pin(ConnectionGater::intercept_accept(self, addrs))
    }

    fn intercept_secured<'a>(
        &'a self,
        direction: Direction,
        peer: PeerId,
        addrs: &'a ConnMultiaddrs,
    ) -> BoxFuture<'a, bool> {
        Box::pin(ConnectionGater::intercept_secured(self, direction, peer, addrs))
    }
}

/// A resource manager refused a connection.
///
/// The reason is displayed verbatim.
#[derive(Debug, Snafu)]
#[snafu(display("{reason}"))]
pub struct ResourceError {
    reason: String,
}

impl ResourceError {
    /// Creates an error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason the connection was refused.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Accounts for the resources used by connections.
///
/// Use [`Builder::resource_manager`] to install a resource manager on a transport.
///
/// [`Builder::resource_manager`]: crate::Builder::resource_manager
pub trait ResourceManager: Debug + Send + Sync {
    /// Opens the scope of a new connection to or from `remote`.
    ///
    /// For inbound connections this is called before the WebTransport upgrade,
    /// a denial is answered with `503 Service Unavailable`. For outbound
    /// connections this is called before any packet is sent.
    fn open_connection<'a>(
        &'a self,
        direction: Direction,
        use_fd: bool,
        remote: &'a Multiaddr,
    ) -> impl Future<Output = Result<Box<dyn ConnectionScope>, ResourceError>> + Send + 'a;
}

pub(crate) trait DynResourceManager: Debug + Send + Sync {
    fn open_connection<'a>(
        &'a self,
        direction: Direction,
        use_fd: bool,
        remote: &'a Multiaddr,
    ) -> BoxFuture<'a, Result<Box<dyn ConnectionScope>, ResourceError>>;
}

impl<T: ResourceManager> DynResourceManager for T {
    fn open_connection<'a>(
        &'a self,
        direction: Direction,
        use_fd: bool,
        remote: &'a Multiaddr,
    ) -> BoxFuture<'a, Result<Box<dyn ConnectionScope>, ResourceError>> {
        Box::pin(ResourceManager::open_connection(self, direction, use_fd, remote))
    }
}

/// The resources held by a single connection.
pub trait ConnectionScope: Debug + Send + Sync {
    /// Attributes the connection to `peer`.
    ///
    /// A denial tears the connection down.
    fn set_peer(&self, peer: PeerId) -> Result<(), ResourceError>;

    /// Releases the scope. Called exactly once.
    fn done(&self);
}

/// A [`ResourceManager`] that allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResourceManager;

impl ResourceManager for NullResourceManager {
    async fn open_connection<'a>(
        &'a self,
        _direction: Direction,
        _use_fd: bool,
        _remote: &'a Multiaddr,
    ) -> Result<Box<dyn ConnectionScope>, ResourceError> {
        Ok(Box::new(NullScope))
    }
}

/// The scope handed out by [`NullResourceManager`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScope;

impl ConnectionScope for NullScope {
    fn set_peer(&self, _peer: PeerId) -> Result<(), ResourceError> {
        Ok(())
    }

    fn done(&self) {}
}

/// Releases a [`ConnectionScope`] exactly once, at the latest when dropped.
#[derive(Debug)]
pub(crate) struct ScopeGuard {
    scope: Box<dyn ConnectionScope>,
    released: AtomicBool,
}

impl ScopeGuard {
    pub(crate) fn new(scope: Box<dyn ConnectionScope>) -> Self {
        Self {
            scope,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_peer(&self, peer: PeerId) -> Result<(), ResourceError> {
        self.scope.set_peer(peer)
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.scope.done();
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Debug, Default)]
    struct CountingScope {
        done: Arc<AtomicUsize>,
    }

    impl ConnectionScope for CountingScope {
        fn set_peer(&self, _peer: PeerId) -> Result<(), ResourceError> {
            Err(ResourceError::new("denied"))
        }

        fn done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn scope_released_once() {
        let done = Arc::new(AtomicUsize::new(0));
        let guard = ScopeGuard::new(Box::new(CountingScope { done: done.clone() }));
        let err = guard.set_peer(PeerId::random()).unwrap_err();
        assert_eq!(err.to_string(), "denied");

        guard.release();
        guard.release();
        drop(guard);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_released_on_drop() {
        let done = Arc::new(AtomicUsize::new(0));
        drop(ScopeGuard::new(Box::new(CountingScope { done: done.clone() })));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct AllowAll;

    impl ConnectionGater for AllowAll {}

    #[tokio::test]
    async fn default_gater_allows() {
        let gater: Arc<dyn DynConnectionGater> = Arc::new(AllowAll);
        let addrs = ConnMultiaddrs {
            local: "/ip4/127.0.0.1/udp/1/quic/webtransport".parse().unwrap(),
            remote: "/ip4/127.0.0.1/udp/2/quic/webtransport".parse().unwrap(),
        };
        assert!(gater.intercept_accept(&addrs).await);
        assert!(
            gater
                .intercept_secured(Direction::Inbound, PeerId::random(), &addrs)
                .await
        );
    }

    #[tokio::test]
    async fn null_resource_manager_allows() {
        let rcmgr: Arc<dyn DynResourceManager> = Arc::new(NullResourceManager);
        let remote: Multiaddr = "/ip4/127.0.0.1/udp/2/quic/webtransport".parse().unwrap();
        let scope = rcmgr
            .open_connection(Direction::Outbound, false, &remote)
            .await
            .unwrap();
        scope.set_peer(PeerId::random()).unwrap();
        scope.done();
    }
}
