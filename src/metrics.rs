//! Metrics for WebTransport listeners and dials.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by a [`Transport`] and its listeners.
///
/// [`Transport`]: crate::Transport
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "webtransport")]
#[non_exhaustive]
pub struct Metrics {
    /*
     * Inbound sessions
     */
    /// QUIC connections refused because too many sessions were being set up.
    pub sessions_refused: Counter,
    /// Sessions whose QUIC handshake or WebTransport request did not finish in time.
    pub sessions_timed_out: Counter,
    /// WebTransport requests received by listeners.
    pub sessions_received: Counter,
    /// Requests rejected because the HTTP path or query did not match.
    pub sessions_rejected_bad_request: Counter,
    /// Requests rejected by the connection gater before the upgrade.
    pub sessions_rejected_gated: Counter,
    /// Requests rejected by the resource manager before the upgrade.
    pub sessions_rejected_resources: Counter,
    /// Requests rejected because too many handshakes were in flight.
    pub sessions_rejected_busy: Counter,
    /// Authenticated sessions dropped because the accept queue was full.
    pub accept_queue_overflow: Counter,

    /*
     * Handshakes
     */
    /// Noise handshakes that failed.
    pub handshakes_failed: Counter,
    /// Noise handshakes that did not finish in time.
    pub handshakes_timed_out: Counter,
    /// Secured connections rejected by the gater or the resource manager.
    pub connections_rejected: Counter,

    /*
     * Connections
     */
    /// Connections handed out by [`Listener::accept`](crate::Listener::accept).
    pub connections_accepted: Counter,
    /// Connections established by [`Transport::dial`](crate::Transport::dial).
    pub connections_dialed: Counter,
    /// Dials that failed, for any reason.
    pub dials_failed: Counter,

    /// Rotations of the listener certificates.
    pub cert_rotations: Counter,
}
