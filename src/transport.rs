//! The WebTransport transport: configuration, listening and dialing.

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use libp2p::{PeerId, identity::Keypair};
use multiaddr::Multiaddr;
use nested_enum_utils::common_fields;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument, trace};
use url::Url;

use crate::{
    addr::{self, AddrError, DialTarget},
    cert_manager::{CertError, CertManager},
    connection::Connection,
    defaults::{HANDSHAKE_TIMEOUT, NOISE_QUERY_TYPE, WEBTRANSPORT_HTTP_ENDPOINT, close_codes},
    handshake::{HandshakeError, Handshaker},
    listener::{Listener, SessionContext},
    metrics::Metrics,
    policy::{
        ConnMultiaddrs, ConnectionGater, Direction, DynConnectionGater, DynResourceManager,
        NullResourceManager, ResourceError, ResourceManager, ScopeGuard,
    },
    tls::{self, CertHashOutcome, CertResolver, ServerTrust, TlsConfigError},
};

/// Builder for [`Transport`].
///
/// By default a transport generates its own rotating certificates, verifies
/// servers by the certificate hashes in the dialed address, accounts for no
/// resources and gates no connections.
#[derive(Debug)]
pub struct Builder {
    keypair: Keypair,
    gater: Option<Arc<dyn DynConnectionGater>>,
    resource_manager: Arc<dyn DynResourceManager>,
    tls_server_config: Option<Arc<rustls::ServerConfig>>,
    tls_client_config: Option<Arc<rustls::ClientConfig>>,
    transport_config: quinn::TransportConfig,
    handshake_timeout: Duration,
}

impl Builder {
    fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            gater: None,
            resource_manager: Arc::new(NullResourceManager),
            tls_server_config: None,
            tls_client_config: None,
            transport_config: quinn::TransportConfig::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Installs a [`ConnectionGater`].
    pub fn connection_gater(mut self, gater: impl ConnectionGater + 'static) -> Self {
        self.gater = Some(Arc::new(gater));
        self
    }

    /// Installs a [`ResourceManager`].
    pub fn resource_manager(mut self, resource_manager: impl ResourceManager + 'static) -> Self {
        self.resource_manager = Arc::new(resource_manager);
        self
    }

    /// Serves this TLS config instead of rotating self-signed certificates.
    ///
    /// Listeners then advertise no certificate hashes, so the certificate must
    /// be trusted by dialers through other means. The ALPN protocols of the
    /// config are replaced with HTTP/3.
    pub fn tls_server_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_server_config = Some(config);
        self
    }

    /// Uses this TLS config for all dials.
    ///
    /// This disables the verification of certificate hashes: the config's own
    /// certificate verifier decides which servers to trust.
    pub fn tls_client_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_client_config = Some(config);
        self
    }

    /// Sets the QUIC transport config used for dials and listeners.
    pub fn transport_config(mut self, transport_config: quinn::TransportConfig) -> Self {
        self.transport_config = transport_config;
        self
    }

    /// Sets how long the noise handshake may take, defaults to [`HANDSHAKE_TIMEOUT`].
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Creates the transport.
    pub fn build(self) -> Transport {
        let handshaker = Handshaker::new(self.keypair, self.handshake_timeout);
        debug!(
            me = %handshaker.local_peer(),
            version = env!("CARGO_PKG_VERSION"),
            "WebTransport transport created"
        );
        Transport {
            inner: Arc::new(Inner {
                handshaker,
                gater: self.gater,
                resource_manager: self.resource_manager,
                tls_server_config: self.tls_server_config,
                tls_client_config: self.tls_client_config,
                transport_config: Arc::new(self.transport_config),
                cert_manager: Mutex::new(None),
                metrics: Default::default(),
            }),
        }
    }
}

/// Error when creating a [`Listener`].
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ListenError {
    #[snafu(display("invalid listen address"))]
    InvalidAddress { source: AddrError },
    #[snafu(display("failed to create certificates"))]
    Certificate { source: CertError },
    #[snafu(display("invalid TLS config"))]
    Tls { source: TlsConfigError },
    #[snafu(display("failed to bind the endpoint"))]
    Bind { source: std::io::Error },
}

/// Error when dialing.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum DialError {
    #[snafu(display("invalid dial address"))]
    InvalidAddress { source: AddrError },
    #[snafu(transparent)]
    ResourceDenied { source: ResourceError },
    #[snafu(display("invalid TLS config"))]
    Tls { source: TlsConfigError },
    #[snafu(display("failed to bind the client endpoint"))]
    Bind { source: std::io::Error },
    #[snafu(display("failed to start the QUIC connection"))]
    Connect { source: quinn::ConnectError },
    #[snafu(display("QUIC handshake failed"))]
    Connection { source: quinn::ConnectionError },
    #[snafu(display("cert hash not found"))]
    CertHashNotFound {},
    #[snafu(display("invalid WebTransport URL"))]
    Url { source: url::ParseError },
    #[snafu(display("WebTransport upgrade failed"))]
    Upgrade {
        source: web_transport_quinn::ClientError,
    },
    #[snafu(display("noise handshake failed"))]
    Handshake { source: HandshakeError },
    #[snafu(display("secured connection gated"))]
    Gated {},
}

/// A libp2p WebTransport transport.
///
/// Dials and listens on `/ip4|ip6/<ip>/udp/<port>/quic/webtransport`
/// addresses. Cloning gives another handle to the same transport. All
/// listeners of a transport share one set of rotating certificates.
#[derive(Debug, Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    handshaker: Handshaker,
    gater: Option<Arc<dyn DynConnectionGater>>,
    resource_manager: Arc<dyn DynResourceManager>,
    tls_server_config: Option<Arc<rustls::ServerConfig>>,
    tls_client_config: Option<Arc<rustls::ClientConfig>>,
    transport_config: Arc<quinn::TransportConfig>,
    /// Created by the first listener.
    cert_manager: Mutex<Option<Arc<CertManager>>>,
    metrics: Arc<Metrics>,
}

impl Transport {
    /// Returns a [`Builder`] for a transport authenticating as `keypair`.
    pub fn builder(keypair: Keypair) -> Builder {
        Builder::new(keypair)
    }

    /// Our peer id.
    pub fn local_peer(&self) -> PeerId {
        self.inner.handshaker.local_peer()
    }

    /// The metrics of this transport and its listeners.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Returns whether `addr` is a WebTransport address this transport can dial.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr::is_dialable(addr)
    }

    /// Starts listening on `addr`.
    ///
    /// The address must not carry certificate hashes. Must be called from
    /// within a tokio runtime.
    #[instrument(skip_all, fields(me = %self.local_peer(), %addr))]
    pub fn listen(&self, addr: &Multiaddr) -> Result<Listener, ListenError> {
        let socket_addr = addr::parse_listen_addr(addr).context(InvalidAddressSnafu)?;
        let transport_config = self.inner.transport_config.clone();

        let (server_config, cert_manager) = match &self.inner.tls_server_config {
            Some(config) => {
                let server_config = tls::quic_server_config((**config).clone(), transport_config)
                    .context(TlsSnafu)?;
                (server_config, None)
            }
            None => {
                let cert_manager = self.cert_manager()?;
                let resolver = Arc::new(CertResolver::new(cert_manager.store().clone()));
                let server_config =
                    tls::make_server_config(resolver, transport_config).context(TlsSnafu)?;
                (server_config, Some(cert_manager))
            }
        };

        let endpoint = quinn::Endpoint::server(server_config, socket_addr).context(BindSnafu)?;
        let local_addr = endpoint.local_addr().context(BindSnafu)?;
        let ctx = SessionContext {
            local_multiaddr: addr::socket_addr_to_webtransport_multiaddr(local_addr),
            handshaker: self.inner.handshaker.clone(),
            gater: self.inner.gater.clone(),
            resource_manager: self.inner.resource_manager.clone(),
            cert_manager,
            metrics: self.inner.metrics.clone(),
        };
        let listener = Listener::spawn(endpoint, ctx).context(BindSnafu)?;
        debug!(addr = %listener.multiaddr(), "listening");
        Ok(listener)
    }

    fn cert_manager(&self) -> Result<Arc<CertManager>, ListenError> {
        let mut cert_manager = self.inner.cert_manager.lock().expect("poisoned");
        if let Some(cert_manager) = &*cert_manager {
            return Ok(cert_manager.clone());
        }
        let created =
            Arc::new(CertManager::new(self.inner.metrics.clone()).context(CertificateSnafu)?);
        *cert_manager = Some(created.clone());
        Ok(created)
    }

    /// Dials `addr` and authenticates the remote as `expected`.
    ///
    /// If `addr` carries certificate hashes, the server certificate must match
    /// one of them. Otherwise it must be trusted by the web PKI roots, or by the
    /// configured [`Builder::tls_client_config`].
    #[instrument(name = "dial", skip_all, fields(me = %self.local_peer(), remote = %expected))]
    pub async fn dial(&self, addr: &Multiaddr, expected: PeerId) -> Result<Connection, DialError> {
        let res = self.dial_inner(addr, expected).await;
        match &res {
            Ok(_) => {
                self.inner.metrics.connections_dialed.inc();
            }
            Err(err) => {
                self.inner.metrics.dials_failed.inc();
                debug!(%addr, "dial failed: {err:#}");
            }
        }
        res
    }

    async fn dial_inner(
        &self,
        addr: &Multiaddr,
        expected: PeerId,
    ) -> Result<Connection, DialError> {
        let target =
            addr::parse_dial_target(addr).context(dial_error::InvalidAddressSnafu)?;

        let scope = self
            .inner
            .resource_manager
            .open_connection(Direction::Outbound, false, addr)
            .await?;
        let scope = ScopeGuard::new(scope);
        scope.set_peer(expected)?;

        let outcome = Arc::new(CertHashOutcome::default());
        let trust = match &self.inner.tls_client_config {
            Some(config) => ServerTrust::Static(config.clone()),
            None if target.cert_hashes.is_empty() => ServerTrust::WebPki,
            None => ServerTrust::CertHashes {
                hashes: target.cert_hashes.clone(),
                outcome: outcome.clone(),
            },
        };
        let client_config = tls::make_client_config(trust, self.inner.transport_config.clone())
            .context(dial_error::TlsSnafu)?;

        let endpoint = quinn::Endpoint::client(unspecified_for(target.socket_addr))
            .context(dial_error::BindSnafu)?;
        let local_addr = endpoint.local_addr().context(dial_error::BindSnafu)?;
        let server_name = target.server_name();
        trace!(remote = %target.socket_addr, %server_name, "connecting");
        let connecting = endpoint
            .connect_with(client_config, target.socket_addr, &server_name)
            .context(dial_error::ConnectSnafu)?;
        let conn = match connecting.await {
            Ok(conn) => conn,
            Err(_) if outcome.mismatched() => return dial_error::CertHashNotFoundSnafu.fail(),
            Err(err) => return Err(err).context(dial_error::ConnectionSnafu),
        };

        // the listener must vouch for the certificate we pinned in the noise handshake
        let pinned: HashSet<_> = outcome.matched().into_iter().collect();
        let url = dial_url(&target)?;
        let session = web_transport_quinn::connect_with(conn, &url)
            .await
            .context(dial_error::UpgradeSnafu)?;

        let peer = match self
            .inner
            .handshaker
            .secure_outbound(&session, Some(expected), pinned)
            .await
        {
            Ok(peer) => peer,
            Err(err) => {
                session.close(close_codes::HANDSHAKE_FAILED, b"handshake failed");
                return Err(err).context(dial_error::HandshakeSnafu);
            }
        };

        let addrs = ConnMultiaddrs {
            local: addr::socket_addr_to_webtransport_multiaddr(local_addr),
            remote: addr::strip_cert_hashes(addr),
        };
        if let Some(gater) = &self.inner.gater {
            if !gater
                .intercept_secured(Direction::Outbound, peer, &addrs)
                .await
            {
                session.close(close_codes::GATED, b"gated");
                return dial_error::GatedSnafu.fail();
            }
        }

        Ok(Connection::new(
            session,
            self.local_peer(),
            peer,
            addrs.local,
            addrs.remote,
            Direction::Outbound,
            scope,
            Some(endpoint),
        ))
    }

    /// Stops the certificate rotation.
    ///
    /// Existing listeners keep serving their current certificate. Listening
    /// again after closing starts a fresh set of certificates.
    pub fn close(&self) {
        if let Some(cert_manager) = self.inner.cert_manager.lock().expect("poisoned").take() {
            cert_manager.stop_rotation();
        }
    }
}

fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    match remote.ip() {
        IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}

/// The URL of the WebTransport endpoint of `target`.
fn dial_url(target: &DialTarget) -> Result<Url, DialError> {
    let host = match (&target.sni, target.socket_addr.ip()) {
        (Some(sni), _) => sni.clone(),
        (None, IpAddr::V4(ip)) => ip.to_string(),
        (None, IpAddr::V6(ip)) => format!("[{ip}]"),
    };
    let url = format!(
        "https://{host}:{}{WEBTRANSPORT_HTTP_ENDPOINT}?type={NOISE_QUERY_TYPE}",
        target.socket_addr.port()
    );
    Url::parse(&url).context(dial_error::UrlSnafu)
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};

    use super::*;

    #[test]
    fn webtransport_url() -> Result {
        let addr = "/ip4/127.0.0.1/udp/4001/quic/webtransport".parse::<Multiaddr>().e()?;
        let url = dial_url(&addr::parse_dial_target(&addr)?)?;
        assert_eq!(
            url.as_str(),
            "https://127.0.0.1:4001/.well-known/libp2p-webtransport?type=noise"
        );

        let addr = "/ip6/::1/udp/4001/quic/webtransport".parse::<Multiaddr>().e()?;
        let url = dial_url(&addr::parse_dial_target(&addr)?)?;
        assert_eq!(url.host_str(), Some("[::1]"));

        let addr = "/ip4/127.0.0.1/udp/4001/quic/sni/example.com/webtransport"
            .parse::<Multiaddr>()
            .e()?;
        let url = dial_url(&addr::parse_dial_target(&addr)?)?;
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.port(), Some(4001));
        Ok(())
    }

    #[test]
    fn can_dial() -> Result {
        let transport = Transport::builder(Keypair::generate_ed25519()).build();
        let valid = "/ip4/127.0.0.1/udp/1234/quic/webtransport".parse::<Multiaddr>().e()?;
        assert!(transport.can_dial(&valid));
        let invalid = "/ip4/127.0.0.1/udp/1234/quic-v1".parse::<Multiaddr>().e()?;
        assert!(!transport.can_dial(&invalid));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_dial_address() -> Result {
        let transport = Transport::builder(Keypair::generate_ed25519()).build();
        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let addr = "/ip4/127.0.0.1/tcp/1234".parse::<Multiaddr>().e()?;
        let err = transport.dial(&addr, peer).await.unwrap_err();
        assert!(matches!(err, DialError::InvalidAddress { .. }));
        Ok(())
    }
}
