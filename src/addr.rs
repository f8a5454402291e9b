//! WebTransport multiaddrs.
//!
//! A WebTransport address names a UDP socket, the QUIC and WebTransport
//! protocol markers and, optionally, the hashes of the certificates the server
//! is allowed to present:
//!
//! ```text
//! /ip4/192.0.2.1/udp/4001/quic/webtransport/certhash/uEi.../certhash/uEi...
//! ```
//!
//! An address may also carry an `/sni/<host>` component, either right after
//! `/quic` or at the very end, which is used as the TLS server name when
//! dialing.

use std::net::{IpAddr, SocketAddr};

use multiaddr::{Multiaddr, Protocol, multihash::Multihash};
use multibase::Base;
use nested_enum_utils::common_fields;
use snafu::{ResultExt, Snafu, ensure};

/// A certificate hash as carried in a `/certhash` component.
pub type CertHash = Multihash<64>;

/// Multihash code of SHA2-256, the only hash function accepted for certificates.
pub const SHA2_256: u64 = 0x12;

const SHA2_256_LEN: usize = 32;

/// Errors from parsing and building WebTransport addresses.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AddrError {
    #[snafu(display("not a WebTransport multiaddr: {addr}"))]
    MalformedAddress { addr: Multiaddr },
    #[snafu(display("not a UDP multiaddr: {addr}"))]
    NotUdp { addr: Multiaddr },
    #[snafu(display("cannot listen on an address with certificate hashes or SNI: {addr}"))]
    NotListenable { addr: Multiaddr },
    #[snafu(display("invalid socket address"))]
    InvalidSocketAddr { source: std::net::AddrParseError },
    #[snafu(display("certificate hash is not multibase encoded"))]
    Multibase { source: multibase::Error },
    #[snafu(display("certificate hash is not a multihash"))]
    Multihash {
        source: multiaddr::multihash::Error,
    },
    #[snafu(display("unsupported certificate hash: code {code:#x} with a {len} byte digest"))]
    MalformedHash { code: u64, len: usize },
}

/// The parts of a WebTransport multiaddr needed to dial it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    /// The UDP socket of the server.
    pub socket_addr: SocketAddr,
    /// TLS server name, from the `/sni` component.
    pub sni: Option<String>,
    /// The certificate hashes, in address order.
    pub cert_hashes: Vec<CertHash>,
}

impl DialTarget {
    /// The name to present in the TLS handshake.
    ///
    /// This is the `/sni` component if there is one and the IP literal otherwise.
    pub fn server_name(&self) -> String {
        match &self.sni {
            Some(sni) => sni.clone(),
            None => self.socket_addr.ip().to_string(),
        }
    }
}

/// Structural decomposition of an address, certificate hashes not yet validated.
struct Parts {
    socket_addr: SocketAddr,
    sni: Option<String>,
    cert_hashes: Vec<CertHash>,
}

fn split(addr: &Multiaddr) -> Option<Parts> {
    let mut iter = addr.iter().peekable();
    let ip: IpAddr = match iter.next()? {
        Protocol::Ip4(ip) => ip.into(),
        Protocol::Ip6(ip) => ip.into(),
        _ => return None,
    };
    let Protocol::Udp(port) = iter.next()? else {
        return None;
    };
    let Protocol::Quic = iter.next()? else {
        return None;
    };
    let mut sni = None;
    if let Some(Protocol::Sni(host)) = iter.peek() {
        sni = Some(host.to_string());
        iter.next();
    }
    let Protocol::WebTransport = iter.next()? else {
        return None;
    };

    let mut cert_hashes = Vec::new();
    for proto in iter.by_ref() {
        match proto {
            Protocol::Certhash(hash) => cert_hashes.push(hash),
            Protocol::Sni(host) if sni.is_none() => {
                sni = Some(host.to_string());
                break;
            }
            _ => return None,
        }
    }
    // `/sni` is always the last component
    if iter.next().is_some() {
        return None;
    }

    Some(Parts {
        socket_addr: SocketAddr::new(ip, port),
        sni,
        cert_hashes,
    })
}

/// Returns whether `addr` is a WebTransport address this transport can dial.
///
/// Certificate hashes are optional. Their absence means the server must
/// present a certificate trusted by the client's root store.
pub fn is_dialable(addr: &Multiaddr) -> bool {
    split(addr).is_some()
}

/// Returns whether `addr` is a WebTransport address this transport can listen on.
///
/// Listen addresses never carry certificate hashes: the listener advertises
/// the hashes of its own certificates.
pub fn is_listenable(addr: &Multiaddr) -> bool {
    matches!(split(addr), Some(parts) if parts.cert_hashes.is_empty() && parts.sni.is_none())
}

/// Parses a dialable address, validating all of its certificate hashes.
pub fn parse_dial_target(addr: &Multiaddr) -> Result<DialTarget, AddrError> {
    let parts = split(addr).ok_or_else(|| MalformedAddressSnafu { addr: addr.clone() }.build())?;
    for hash in &parts.cert_hashes {
        validate_cert_hash(hash)?;
    }
    Ok(DialTarget {
        socket_addr: parts.socket_addr,
        sni: parts.sni,
        cert_hashes: parts.cert_hashes,
    })
}

/// Parses a listen address into the socket to bind.
pub fn parse_listen_addr(addr: &Multiaddr) -> Result<SocketAddr, AddrError> {
    let parts = split(addr).ok_or_else(|| MalformedAddressSnafu { addr: addr.clone() }.build())?;
    ensure!(
        parts.cert_hashes.is_empty() && parts.sni.is_none(),
        NotListenableSnafu { addr: addr.clone() }
    );
    Ok(parts.socket_addr)
}

/// Extracts all certificate hashes of `addr`, in order.
///
/// Fails if any of them is not a SHA2-256 multihash.
pub fn extract_cert_hashes(addr: &Multiaddr) -> Result<Vec<CertHash>, AddrError> {
    addr.iter()
        .filter_map(|proto| match proto {
            Protocol::Certhash(hash) => Some(hash),
            _ => None,
        })
        .map(|hash| validate_cert_hash(&hash).map(|()| hash))
        .collect()
}

fn validate_cert_hash(hash: &CertHash) -> Result<(), AddrError> {
    ensure!(
        hash.code() == SHA2_256 && hash.digest().len() == SHA2_256_LEN,
        MalformedHashSnafu {
            code: hash.code(),
            len: hash.digest().len(),
        }
    );
    Ok(())
}

/// Removes all `/certhash` components from `addr`.
///
/// Gating and address comparisons operate on stripped addresses.
pub fn strip_cert_hashes(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|proto| !matches!(proto, Protocol::Certhash(_)))
        .collect()
}

/// Returns whether two addresses are equal, ignoring their certificate hashes.
pub fn same_endpoint(a: &Multiaddr, b: &Multiaddr) -> bool {
    strip_cert_hashes(a) == strip_cert_hashes(b)
}

/// Builds the WebTransport multiaddr of a UDP socket, without certificate hashes.
pub fn socket_addr_to_webtransport_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::from(addr.ip())
        .with(Protocol::Udp(addr.port()))
        .with(Protocol::Quic)
        .with(Protocol::WebTransport)
}

/// Turns an `/ip4|ip6/<ip>/udp/<port>` multiaddr into its WebTransport form.
pub fn to_webtransport_multiaddr(addr: &Multiaddr) -> Result<Multiaddr, AddrError> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next() {
        Some(Protocol::Ip4(ip)) => ip.into(),
        Some(Protocol::Ip6(ip)) => ip.into(),
        _ => return NotUdpSnafu { addr: addr.clone() }.fail(),
    };
    match (iter.next(), iter.next()) {
        (Some(Protocol::Udp(port)), None) => {
            Ok(socket_addr_to_webtransport_multiaddr(SocketAddr::new(ip, port)))
        }
        _ => NotUdpSnafu { addr: addr.clone() }.fail(),
    }
}

/// Parses `host:port` (e.g. `127.0.0.1:4001` or `[::1]:4001`) into a WebTransport multiaddr.
pub fn string_to_webtransport_multiaddr(s: &str) -> Result<Multiaddr, AddrError> {
    let addr: SocketAddr = s.parse().context(InvalidSocketAddrSnafu)?;
    Ok(socket_addr_to_webtransport_multiaddr(addr))
}

/// Wraps a raw SHA2-256 digest into a `/certhash` component.
pub fn cert_hash_component(digest: &[u8]) -> Result<Protocol<'static>, AddrError> {
    let hash = CertHash::wrap(SHA2_256, digest).context(MultihashSnafu)?;
    validate_cert_hash(&hash)?;
    Ok(Protocol::Certhash(hash))
}

/// Renders a certificate hash as multibase Base58BTC text.
pub fn encode_cert_hash(hash: &CertHash) -> String {
    multibase::encode(Base::Base58Btc, hash.to_bytes())
}

/// Parses a multibase encoded certificate hash.
///
/// Any multibase prefix is accepted, but the multihash must be SHA2-256.
pub fn decode_cert_hash(s: &str) -> Result<CertHash, AddrError> {
    let (_base, bytes) = multibase::decode(s).context(MultibaseSnafu)?;
    let hash = CertHash::from_bytes(&bytes).context(MultihashSnafu)?;
    validate_cert_hash(&hash)?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};

    use super::*;

    fn hash(byte: u8) -> CertHash {
        CertHash::wrap(SHA2_256, &[byte; 32]).unwrap()
    }

    fn with_hashes(addr: &str, hashes: &[CertHash]) -> Multiaddr {
        let mut addr: Multiaddr = addr.parse().unwrap();
        for hash in hashes {
            addr.push(Protocol::Certhash(*hash));
        }
        addr
    }

    #[test]
    fn dialable_addrs() -> Result {
        let valid = [
            with_hashes("/ip4/127.0.0.1/udp/1234/quic/webtransport", &[]),
            with_hashes("/ip6/::1/udp/1234/quic/webtransport", &[]),
            with_hashes("/ip4/127.0.0.1/udp/1234/quic/webtransport", &[hash(1)]),
            with_hashes(
                "/ip4/127.0.0.1/udp/1234/quic/webtransport",
                &[hash(1), hash(2)],
            ),
            "/ip4/127.0.0.1/udp/1234/quic/sni/example.com/webtransport"
                .parse::<Multiaddr>()
                .e()?,
            "/ip4/127.0.0.1/udp/1234/quic/webtransport/sni/example.com"
                .parse::<Multiaddr>()
                .e()?,
        ];
        for addr in valid {
            assert!(is_dialable(&addr), "{addr} should be dialable");
        }

        let invalid: [Multiaddr; 6] = [
            "/ip4/127.0.0.1/udp/1234/quic/webtransport/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .parse::<Multiaddr>()
                .e()?,
            "/ip4/127.0.0.1/udp/1234/quic-v1/webtransport".parse::<Multiaddr>().e()?,
            "/ip4/127.0.0.1/udp/1234/quic".parse::<Multiaddr>().e()?,
            "/ip4/127.0.0.1/udp/1234/webtransport".parse::<Multiaddr>().e()?,
            "/ip4/127.0.0.1/tcp/1234/webtransport".parse::<Multiaddr>().e()?,
            "/dns4/example.com/udp/1234/quic/webtransport".parse::<Multiaddr>().e()?,
        ];
        for addr in invalid {
            assert!(!is_dialable(&addr), "{addr} should not be dialable");
            assert!(!is_listenable(&addr), "{addr} should not be listenable");
        }
        Ok(())
    }

    #[test]
    fn listen_addrs() -> Result {
        let addr = "/ip4/127.0.0.1/udp/0/quic/webtransport".parse::<Multiaddr>().e()?;
        assert!(is_listenable(&addr));
        assert_eq!(
            parse_listen_addr(&addr)?,
            "127.0.0.1:0".parse::<SocketAddr>().e()?
        );

        let with_hash = with_hashes("/ip4/127.0.0.1/udp/1234/quic/webtransport", &[hash(1)]);
        assert!(!is_listenable(&with_hash));
        assert!(matches!(
            parse_listen_addr(&with_hash),
            Err(AddrError::NotListenable { .. })
        ));

        let tcp = "/ip4/127.0.0.1/tcp/1234/webtransport".parse::<Multiaddr>().e()?;
        assert!(matches!(
            parse_listen_addr(&tcp),
            Err(AddrError::MalformedAddress { .. })
        ));
        Ok(())
    }

    #[test]
    fn dial_target() -> Result {
        let addr = with_hashes(
            "/ip6/::1/udp/4001/quic/webtransport",
            &[hash(1), hash(2)],
        );
        let target = parse_dial_target(&addr)?;
        assert_eq!(target.socket_addr, "[::1]:4001".parse::<SocketAddr>().e()?);
        assert_eq!(target.cert_hashes, vec![hash(1), hash(2)]);
        assert_eq!(target.server_name(), "::1");

        let addr = "/ip4/127.0.0.1/udp/4001/quic/sni/example.com/webtransport"
            .parse::<Multiaddr>()
            .e()?;
        let target = parse_dial_target(&addr)?;
        assert_eq!(target.sni.as_deref(), Some("example.com"));
        assert_eq!(target.server_name(), "example.com");
        Ok(())
    }

    #[test]
    fn reject_foreign_hashes() -> Result {
        let sha512 = CertHash::wrap(0x13, &[7u8; 64]).e()?;
        let addr = with_hashes("/ip4/127.0.0.1/udp/1234/quic/webtransport", &[hash(1), sha512]);
        assert!(is_dialable(&addr));
        assert!(matches!(
            extract_cert_hashes(&addr),
            Err(AddrError::MalformedHash { code: 0x13, len: 64, .. })
        ));
        assert!(parse_dial_target(&addr).is_err());

        let short = CertHash::wrap(SHA2_256, &[7u8; 16]).e()?;
        let addr = with_hashes("/ip4/127.0.0.1/udp/1234/quic/webtransport", &[short]);
        assert!(extract_cert_hashes(&addr).is_err());
        Ok(())
    }

    #[test]
    fn extract_in_order() -> Result {
        let addr = with_hashes(
            "/ip4/127.0.0.1/udp/1234/quic/webtransport",
            &[hash(3), hash(1), hash(2)],
        );
        assert_eq!(extract_cert_hashes(&addr)?, vec![hash(3), hash(1), hash(2)]);

        let plain = "/ip4/127.0.0.1/udp/1234/quic/webtransport".parse::<Multiaddr>().e()?;
        assert!(extract_cert_hashes(&plain)?.is_empty());
        Ok(())
    }

    #[test]
    fn stripping() -> Result {
        let plain = "/ip4/127.0.0.1/udp/1234/quic/webtransport".parse::<Multiaddr>().e()?;
        let hashed = with_hashes("/ip4/127.0.0.1/udp/1234/quic/webtransport", &[hash(1), hash(2)]);
        assert_eq!(strip_cert_hashes(&hashed), plain);
        assert!(same_endpoint(&plain, &hashed));

        let other = with_hashes("/ip4/127.0.0.1/udp/1235/quic/webtransport", &[hash(1)]);
        assert!(!same_endpoint(&hashed, &other));
        Ok(())
    }

    #[test]
    fn webtransport_multiaddr_from_udp() -> Result {
        let udp = "/ip4/127.0.0.1/udp/1337".parse::<Multiaddr>().e()?;
        assert_eq!(
            to_webtransport_multiaddr(&udp)?,
            "/ip4/127.0.0.1/udp/1337/quic/webtransport".parse::<Multiaddr>().e()?
        );

        let tcp = "/ip4/127.0.0.1/tcp/1337".parse::<Multiaddr>().e()?;
        assert!(matches!(
            to_webtransport_multiaddr(&tcp),
            Err(AddrError::NotUdp { .. })
        ));
        Ok(())
    }

    #[test]
    fn string_to_multiaddr() -> Result {
        assert_eq!(
            string_to_webtransport_multiaddr("1.2.3.4:60042")?,
            "/ip4/1.2.3.4/udp/60042/quic/webtransport".parse::<Multiaddr>().e()?
        );
        assert_eq!(
            string_to_webtransport_multiaddr("[2001:db8::1]:443")?,
            "/ip6/2001:db8::1/udp/443/quic/webtransport".parse::<Multiaddr>().e()?
        );
        assert!(string_to_webtransport_multiaddr("example.com:443").is_err());
        Ok(())
    }

    #[test]
    fn cert_hash_text() -> Result {
        let original = hash(42);
        let encoded = encode_cert_hash(&original);
        assert!(encoded.starts_with('z'), "base58btc prefix: {encoded}");
        assert_eq!(decode_cert_hash(&encoded)?, original);

        // other multibase encodings are accepted on input
        let base64url = multibase::encode(Base::Base64Url, original.to_bytes());
        assert_eq!(decode_cert_hash(&base64url)?, original);

        let truncated = multibase::encode(Base::Base58Btc, &original.to_bytes()[..20]);
        assert!(matches!(
            decode_cert_hash(&truncated),
            Err(AddrError::Multihash { .. })
        ));
        assert!(matches!(
            decode_cert_hash("!not-multibase"),
            Err(AddrError::Multibase { .. })
        ));
        Ok(())
    }

    #[test]
    fn cert_hash_components() -> Result {
        let component = cert_hash_component(&[9u8; 32])?;
        assert_eq!(component, Protocol::Certhash(hash(9)));
        assert!(matches!(
            cert_hash_component(&[9u8; 31]),
            Err(AddrError::MalformedHash { len: 31, .. })
        ));
        Ok(())
    }
}
