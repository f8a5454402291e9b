//! The noise handshake on the first stream of a WebTransport session.
//!
//! Once QUIC and the WebTransport upgrade are done, the dialer opens a
//! bidirectional stream and runs the libp2p noise XX handshake on it. The
//! listener accepts that stream and answers. The handshake authenticates the
//! long-term identity of both peers. The listener also reports its certificate
//! hashes in the noise extensions, and the dialer checks that the certificate
//! it verified is among them.

use std::{collections::HashSet, time::Duration};

use libp2p::{
    PeerId,
    core::upgrade::{InboundConnectionUpgrade, OutboundConnectionUpgrade},
    identity::Keypair,
    noise,
};
use n0_future::time;
use nested_enum_utils::common_fields;
use snafu::{ResultExt, Snafu, ensure};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::trace;
use web_transport_quinn::Session;

use crate::addr::CertHash;

mod stream;

pub(crate) use self::stream::BiStream;

/// The protocol name noise is negotiated as.
const NOISE_PROTOCOL: &str = "/noise";

/// Errors from the noise handshake.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum HandshakeError {
    #[snafu(display("failed to set up noise"))]
    Config { source: noise::Error },
    #[snafu(display("failed to open the handshake stream"))]
    Stream {
        source: web_transport_quinn::SessionError,
    },
    #[snafu(display("noise handshake failed"))]
    Noise { source: noise::Error },
    #[snafu(display("noise handshake timed out"))]
    Timeout {},
    #[snafu(display("peer id mismatch: expected {expected}, got {actual}"))]
    IdentityMismatch { expected: PeerId, actual: PeerId },
}

/// Runs the noise handshake for one side of a session.
#[derive(Debug, Clone)]
pub(crate) struct Handshaker {
    keypair: Keypair,
    timeout: Duration,
}

impl Handshaker {
    pub(crate) fn new(keypair: Keypair, timeout: Duration) -> Self {
        Self { keypair, timeout }
    }

    pub(crate) fn local_peer(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Accepts the first stream of `session` and authenticates the dialer.
    ///
    /// `cert_hashes` are reported to the dialer.
    pub(crate) async fn secure_inbound(
        &self,
        session: &Session,
        cert_hashes: HashSet<CertHash>,
    ) -> Result<PeerId, HandshakeError> {
        time::timeout(self.timeout, async {
            let (send, recv) = session.clone().accept_bi().await.context(StreamSnafu)?;
            self.secure_inbound_stream(BiStream::new(send, recv), cert_hashes)
                .await
        })
        .await
        .map_err(|_| TimeoutSnafu.build())?
    }

    /// Opens the first stream of `session` and authenticates the listener.
    ///
    /// If `cert_hashes` is not empty, the listener must report all of them.
    pub(crate) async fn secure_outbound(
        &self,
        session: &Session,
        expected: Option<PeerId>,
        cert_hashes: HashSet<CertHash>,
    ) -> Result<PeerId, HandshakeError> {
        time::timeout(self.timeout, async {
            let (send, recv) = session.open_bi().await.context(StreamSnafu)?;
            self.secure_outbound_stream(BiStream::new(send, recv), expected, cert_hashes)
                .await
        })
        .await
        .map_err(|_| TimeoutSnafu.build())?
    }

    pub(crate) async fn secure_inbound_stream<S>(
        &self,
        stream: S,
        cert_hashes: HashSet<CertHash>,
    ) -> Result<PeerId, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.config(cert_hashes)?;
        let (peer, _output) = config
            .upgrade_inbound(stream.compat(), NOISE_PROTOCOL)
            .await
            .context(NoiseSnafu)?;
        trace!(%peer, "inbound noise handshake done");
        Ok(peer)
    }

    pub(crate) async fn secure_outbound_stream<S>(
        &self,
        stream: S,
        expected: Option<PeerId>,
        cert_hashes: HashSet<CertHash>,
    ) -> Result<PeerId, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.config(cert_hashes)?;
        let (peer, _output) = config
            .upgrade_outbound(stream.compat(), NOISE_PROTOCOL)
            .await
            .context(NoiseSnafu)?;
        if let Some(expected) = expected {
            ensure!(
                peer == expected,
                IdentityMismatchSnafu {
                    expected,
                    actual: peer
                }
            );
        }
        trace!(%peer, "outbound noise handshake done");
        Ok(peer)
    }

    fn config(&self, cert_hashes: HashSet<CertHash>) -> Result<noise::Config, HandshakeError> {
        let config = noise::Config::new(&self.keypair).context(ConfigSnafu)?;
        if cert_hashes.is_empty() {
            Ok(config)
        } else {
            Ok(config.with_webtransport_certhashes(cert_hashes))
        }
    }
}
