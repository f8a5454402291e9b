//! Default values used in [`iroh_webtransport`][`crate`]

use std::time::Duration;

/// The HTTP path on which WebTransport sessions are accepted.
pub const WEBTRANSPORT_HTTP_ENDPOINT: &str = "/.well-known/libp2p-webtransport";

/// The value of the `type` query parameter selecting the noise handshake.
pub const NOISE_QUERY_TYPE: &str = "noise";

/// Maximum number of authenticated connections waiting to be accepted.
///
/// This is also the maximum number of sessions a listener keeps in the
/// half-open state, between the WebTransport upgrade and the end of the noise
/// handshake.
pub const ACCEPT_QUEUE_LEN: usize = 16;

/// Maximum number of inbound sessions a listener sets up at the same time.
///
/// This covers every session from its QUIC handshake until it is queued for
/// [`Listener::accept`] or dropped. Connections beyond the limit are refused.
///
/// [`Listener::accept`]: crate::Listener::accept
pub const MAX_PENDING_SESSIONS: usize = 4 * ACCEPT_QUEUE_LEN;

/// Time allowed for each step of setting up a session: the QUIC handshake,
/// the WebTransport request and the noise handshake on the first stream.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Validity of a generated certificate.
///
/// Browsers refuse hash-pinned certificates valid for longer than two weeks.
pub const CERT_VALIDITY: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Interval between certificate rotations.
pub const CERT_ROTATION_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How far into the past a certificate's validity is backdated.
pub const CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(60 * 60);

/// QUIC application close codes used by this crate.
pub mod close_codes {
    /// Normal close of a connection.
    pub const NORMAL: u32 = 0;
    /// The listener dropped a session because its accept queue was full.
    pub const ACCEPT_QUEUE_FULL: u32 = 1;
    /// A connection gater rejected the secured connection.
    pub const GATED: u32 = 2;
    /// The resource manager refused to account for the remote peer.
    pub const RESOURCE_DENIED: u32 = 3;
    /// The noise handshake failed or timed out.
    pub const HANDSHAKE_FAILED: u32 = 4;
}
