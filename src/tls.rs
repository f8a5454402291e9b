//! TLS configuration for WebTransport servers and clients.
//!
//! Servers present a self-signed certificate from the [`CertManager`], or a
//! certificate chosen by a caller-supplied [`rustls::ServerConfig`]. Clients
//! either pin the certificate hashes carried in the dialed address or fall
//! back to regular WebPKI verification.
//!
//! [`CertManager`]: crate::cert_manager::CertManager

use std::sync::Arc;

use nested_enum_utils::common_fields;
use quinn::crypto::rustls::{NoInitialCipherSuite, QuicClientConfig, QuicServerConfig};
use rustls::{SupportedProtocolVersion, crypto::CryptoProvider, server::ResolvesServerCert};
use snafu::{ResultExt, Snafu};

use crate::addr::CertHash;

mod resolver;
mod verifier;

pub(crate) use self::{
    resolver::CertResolver,
    verifier::{CertHashOutcome, CertHashVerifier},
};

/// The only TLS version we support is 1.3
pub(crate) static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Error for generating TLS configs.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum TlsConfigError {
    #[snafu(display("rustls error"))]
    Rustls { source: rustls::Error },
    #[snafu(display("TLS config has no QUIC compatible cipher suite"))]
    NoCipherSuite { source: NoInitialCipherSuite },
}

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds the QUIC server config serving the certificates of `resolver`.
pub(crate) fn make_server_config(
    resolver: Arc<dyn ResolvesServerCert>,
    transport_config: Arc<quinn::TransportConfig>,
) -> Result<quinn::ServerConfig, TlsConfigError> {
    let crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .context(RustlsSnafu)?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    quic_server_config(crypto, transport_config)
}

/// Wraps a rustls server config for QUIC, forcing the HTTP/3 ALPN.
pub(crate) fn quic_server_config(
    mut crypto: rustls::ServerConfig,
    transport_config: Arc<quinn::TransportConfig>,
) -> Result<quinn::ServerConfig, TlsConfigError> {
    crypto.alpn_protocols = vec![web_transport_quinn::ALPN.to_vec()];
    let crypto = QuicServerConfig::try_from(crypto).context(NoCipherSuiteSnafu)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config);
    Ok(config)
}

/// How a dialer decides whether to trust the server certificate.
#[derive(Debug, Clone)]
pub(crate) enum ServerTrust {
    /// Accept only certificates whose SHA2-256 hash is one of these.
    ///
    /// `outcome` tells the dialer which hash matched, or that none did.
    CertHashes {
        hashes: Vec<CertHash>,
        outcome: Arc<CertHashOutcome>,
    },
    /// Regular WebPKI verification against the bundled web roots.
    WebPki,
    /// A caller-supplied client config, used as is.
    Static(Arc<rustls::ClientConfig>),
}

/// Builds the QUIC client config for a single dial.
pub(crate) fn make_client_config(
    trust: ServerTrust,
    transport_config: Arc<quinn::TransportConfig>,
) -> Result<quinn::ClientConfig, TlsConfigError> {
    let mut crypto = match trust {
        ServerTrust::CertHashes { hashes, outcome } => {
            let provider = crypto_provider();
            let verifier = CertHashVerifier::new(hashes, provider.clone(), outcome);
            rustls::ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(PROTOCOL_VERSIONS)
                .context(RustlsSnafu)?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth()
        }
        ServerTrust::WebPki => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder_with_provider(crypto_provider())
                .with_protocol_versions(PROTOCOL_VERSIONS)
                .context(RustlsSnafu)?
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        ServerTrust::Static(config) => (*config).clone(),
    };
    crypto.alpn_protocols = vec![web_transport_quinn::ALPN.to_vec()];
    let crypto = QuicClientConfig::try_from(crypto).context(NoCipherSuiteSnafu)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config);
    Ok(config)
}
