//! Rotating self-signed certificates for WebTransport listeners.
//!
//! Certificates live on a fixed schedule. Certificate `k` is served from
//! `start + k * CERT_ROTATION_INTERVAL` on and is valid for [`CERT_VALIDITY`],
//! backdated by [`CLOCK_SKEW_ALLOWANCE`]. At any time the manager holds the
//! certificate being served and the one that follows it, and advertises the
//! hashes of both. An address handed out before a rotation therefore keeps
//! working after it, since the new current certificate was already advertised
//! as the next one.
//!
//! The schedule follows the wall clock. When rotations were missed, for
//! example while the host was suspended, the manager skips straight to the
//! certificate due at the current time.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};

use multiaddr::Protocol;
use n0_future::task::{self, AbortOnDropHandle};
use nested_enum_utils::common_fields;
use rustls::{crypto::ring::sign::any_ecdsa_type, sign::CertifiedKey};
use snafu::{ResultExt, Snafu};
use time::OffsetDateTime;
use tracing::{Instrument, debug, info_span, warn};
use webpki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::{
    addr::{CertHash, SHA2_256},
    defaults::{CERT_ROTATION_INTERVAL, CERT_VALIDITY, CLOCK_SKEW_ALLOWANCE},
    metrics::Metrics,
};

/// Delay before retrying a failed rotation.
const ROTATION_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Errors from generating a certificate.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CertError {
    #[snafu(display("failed to generate certificate"))]
    Generate { source: rcgen::Error },
    #[snafu(display("failed to load certificate key"))]
    SigningKey { source: rustls::Error },
    #[snafu(display("failed to hash certificate"))]
    Hash {
        source: multiaddr::multihash::Error,
    },
}

/// A generated certificate together with its key and hash.
#[derive(derive_more::Debug)]
pub(crate) struct CertRecord {
    /// Position of this certificate in the rotation schedule.
    pub(crate) index: u32,
    #[debug(skip)]
    pub(crate) key: Arc<CertifiedKey>,
    pub(crate) hash: CertHash,
    pub(crate) not_before: SystemTime,
    pub(crate) not_after: SystemTime,
}

impl CertRecord {
    fn generate(start: SystemTime, index: u32) -> Result<Self, CertError> {
        let not_before = start + CERT_ROTATION_INTERVAL * index - CLOCK_SKEW_ALLOWANCE;
        let not_after = not_before + CERT_VALIDITY;

        let key_pair = rcgen::KeyPair::generate().context(GenerateSnafu)?;
        let mut params =
            rcgen::CertificateParams::new(Vec::<String>::new()).context(GenerateSnafu)?;
        params.not_before = OffsetDateTime::from(not_before);
        params.not_after = OffsetDateTime::from(not_after);
        let cert = params.self_signed(&key_pair).context(GenerateSnafu)?;
        let cert_der = cert.der().clone();

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = any_ecdsa_type(&key_der).context(SigningKeySnafu)?;

        let digest = ring::digest::digest(&ring::digest::SHA256, cert_der.as_ref());
        let hash = CertHash::wrap(SHA2_256, digest.as_ref()).context(HashSnafu)?;

        Ok(Self {
            index,
            key: Arc::new(CertifiedKey::new(vec![cert_der], signing_key)),
            hash,
            not_before,
            not_after,
        })
    }
}

#[derive(Debug)]
struct CertState {
    /// The certificate served before the last rotation.
    previous: Option<Arc<CertRecord>>,
    current: Arc<CertRecord>,
    next: Arc<CertRecord>,
}

/// The certificate state shared between the manager and the TLS resolver.
#[derive(Debug)]
pub(crate) struct CertStore {
    start: SystemTime,
    state: RwLock<CertState>,
    metrics: Arc<Metrics>,
}

impl CertStore {
    fn new(start: SystemTime, metrics: Arc<Metrics>) -> Result<Self, CertError> {
        let state = CertState {
            previous: None,
            current: Arc::new(CertRecord::generate(start, 0)?),
            next: Arc::new(CertRecord::generate(start, 1)?),
        };
        Ok(Self {
            start,
            state: RwLock::new(state),
            metrics,
        })
    }

    /// The certificate to serve right now.
    pub(crate) fn current(&self) -> Arc<CertRecord> {
        self.state.read().expect("poisoned").current.clone()
    }

    fn hashes(&self) -> [CertHash; 2] {
        let state = self.state.read().expect("poisoned");
        [state.current.hash, state.next.hash]
    }

    fn all_hashes(&self) -> HashSet<CertHash> {
        let state = self.state.read().expect("poisoned");
        state
            .previous
            .iter()
            .chain([&state.current, &state.next])
            .map(|record| record.hash)
            .collect()
    }

    /// Index of the certificate the schedule says should be served at `now`.
    fn due_index(&self, now: SystemTime) -> u32 {
        let elapsed = now.duration_since(self.start).unwrap_or_default();
        let index = elapsed.as_secs() / CERT_ROTATION_INTERVAL.as_secs();
        u32::try_from(index).unwrap_or(u32::MAX)
    }

    /// Time from `now` until the next certificate is due, zero if it is overdue.
    fn until_next_rotation(&self, now: SystemTime) -> Duration {
        let index = self.state.read().expect("poisoned").current.index;
        let due = self.start + CERT_ROTATION_INTERVAL * (index + 1);
        due.duration_since(now).unwrap_or_default()
    }

    /// Moves on to the next certificate and generates its successor.
    #[cfg(test)]
    pub(crate) fn rotate(&self) -> Result<(), CertError> {
        let index = self.current().index + 1;
        self.advance_to(index)
    }

    /// Rotates at least once, and further if the certificate due at `now` is
    /// more than one step ahead.
    pub(crate) fn rotate_at(&self, now: SystemTime) -> Result<(), CertError> {
        let index = (self.current().index + 1).max(self.due_index(now));
        self.advance_to(index)
    }

    /// Serves certificate `index` and generates its successor.
    ///
    /// Certificates between the current one and `index` are skipped. New
    /// certificates are generated before the lock is taken, so readers are
    /// never blocked on key generation.
    fn advance_to(&self, index: u32) -> Result<(), CertError> {
        let next = self.state.read().expect("poisoned").next.clone();
        let current = if next.index == index {
            next
        } else {
            Arc::new(CertRecord::generate(self.start, index)?)
        };
        let upcoming = Arc::new(CertRecord::generate(self.start, index + 1)?);
        {
            let mut state = self.state.write().expect("poisoned");
            let previous = std::mem::replace(&mut state.current, current);
            state.previous = Some(previous);
            state.next = upcoming;
        }
        self.metrics.cert_rotations.inc();
        Ok(())
    }
}

/// Owns the rotating certificates of a transport's listeners.
///
/// Dropping the manager stops the rotation.
#[derive(Debug)]
pub(crate) struct CertManager {
    store: Arc<CertStore>,
    rotation: AbortOnDropHandle<()>,
}

impl CertManager {
    /// Creates a manager whose first certificate starts now.
    pub(crate) fn new(metrics: Arc<Metrics>) -> Result<Self, CertError> {
        Self::with_start(SystemTime::now(), metrics)
    }

    pub(crate) fn with_start(start: SystemTime, metrics: Arc<Metrics>) -> Result<Self, CertError> {
        let store = Arc::new(CertStore::new(start, metrics)?);
        let rotation = task::spawn(
            rotate_loop(store.clone()).instrument(info_span!("cert-rotation")),
        );
        Ok(Self {
            store,
            rotation: AbortOnDropHandle::new(rotation),
        })
    }

    /// Stops rotating. The current certificate keeps being served.
    pub(crate) fn stop_rotation(&self) {
        self.rotation.abort();
    }

    pub(crate) fn store(&self) -> &Arc<CertStore> {
        &self.store
    }

    /// The hashes to publish: the current certificate's first, then the next one's.
    pub(crate) fn advertised_hashes(&self) -> Vec<CertHash> {
        self.store.hashes().to_vec()
    }

    /// The hashes reported in the noise handshake.
    ///
    /// Besides the advertised hashes this includes the previous certificate,
    /// so that dialers holding an address from before the last rotation still
    /// pass the check.
    pub(crate) fn reported_hashes(&self) -> HashSet<CertHash> {
        self.store.all_hashes()
    }

    /// The advertised hashes as `/certhash` components.
    pub(crate) fn addr_components(&self) -> Vec<Protocol<'static>> {
        self.store
            .hashes()
            .into_iter()
            .map(Protocol::Certhash)
            .collect()
    }
}

async fn rotate_loop(store: Arc<CertStore>) {
    loop {
        n0_future::time::sleep(store.until_next_rotation(SystemTime::now())).await;
        match store.rotate_at(SystemTime::now()) {
            Ok(()) => {
                let current = store.current();
                debug!(
                    index = current.index,
                    valid_from = ?current.not_before,
                    valid_until = ?current.not_after,
                    "rotated certificate"
                );
            }
            // keep serving the old certificates
            Err(err) => {
                warn!("failed to rotate certificate: {err:#}");
                n0_future::time::sleep(ROTATION_RETRY_DELAY).await;
            }
        }
    }
}
