//! A libp2p WebTransport transport.
//!
//! Peers reach each other over QUIC and HTTP/3 WebTransport, and authenticate
//! each other with the libp2p noise handshake on the first stream of the
//! session. Listeners do not need a certificate signed by a certificate
//! authority: they rotate short-lived self-signed certificates and publish
//! their hashes in their address, for example
//!
//! ```text
//! /ip4/192.0.2.1/udp/4001/quic/webtransport/certhash/zQmb.../certhash/zQmc...
//! ```
//!
//! A dialer only accepts a certificate whose hash is in the dialed address.
//!
//! # Example
//!
//! ```no_run
//! # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
//! use iroh_webtransport::{Keypair, Transport};
//! use tokio::io::AsyncWriteExt;
//!
//! let server = Transport::builder(Keypair::generate_ed25519()).build();
//! let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic/webtransport".parse()?)?;
//!
//! let client = Transport::builder(Keypair::generate_ed25519()).build();
//! let conn = client
//!     .dial(&listener.multiaddr(), server.local_peer())
//!     .await?;
//! let (mut send, _recv) = conn.open_bi().await?;
//! send.write_all(b"hello").await?;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(iroh_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addr;
mod cert_manager;
mod connection;
pub mod defaults;
mod handshake;
mod listener;
pub mod metrics;
mod policy;
mod tls;
mod transport;

pub use libp2p::{PeerId, identity::Keypair};
pub use multiaddr::Multiaddr;
pub use web_transport_quinn::{RecvStream, SendStream, SessionError};

pub use self::{
    cert_manager::CertError,
    connection::Connection,
    handshake::HandshakeError,
    listener::{AcceptError, CloseError, Listener},
    policy::{
        ConnMultiaddrs, ConnectionGater, ConnectionScope, Direction, NullResourceManager,
        NullScope, ResourceError, ResourceManager,
    },
    tls::TlsConfigError,
    transport::{Builder, DialError, ListenError, Transport},
};
