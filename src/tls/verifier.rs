//! Server certificate verification by certificate hash.
//!
//! WebTransport servers reachable by address alone present short-lived
//! self-signed certificates. Instead of a chain to a trusted root, the dialer
//! pins the SHA2-256 hashes published in the server's multiaddr. A pinned
//! certificate must still be valid at the time of the handshake, and may not
//! be valid for longer than [`CERT_VALIDITY`].

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use der::{
    Reader, SliceReader, Tag,
    asn1::{GeneralizedTime, UtcTime},
};
use rustls::{
    CertificateError, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls13_signature},
};
use tracing::debug;
use webpki_types::{CertificateDer, ServerName, UnixTime};

use crate::{
    addr::{CertHash, SHA2_256},
    defaults::CERT_VALIDITY,
};

/// The result of a certificate hash check, shared with the dialer.
#[derive(Debug, Default)]
pub(crate) struct CertHashOutcome {
    matched: Mutex<Option<CertHash>>,
    mismatch: AtomicBool,
}

impl CertHashOutcome {
    /// The pinned hash the server certificate matched.
    pub(crate) fn matched(&self) -> Option<CertHash> {
        *self.matched.lock().expect("poisoned")
    }

    /// Whether a server certificate was rejected for matching no pinned hash.
    pub(crate) fn mismatched(&self) -> bool {
        self.mismatch.load(Ordering::Relaxed)
    }
}

/// Accepts a server certificate only if its hash is one of the pinned hashes.
///
/// Only TLS 1.3 is supported. TLS 1.2 should be disabled in the configuration of `rustls`.
#[derive(Debug)]
pub(crate) struct CertHashVerifier {
    hashes: Vec<CertHash>,
    provider: Arc<CryptoProvider>,
    outcome: Arc<CertHashOutcome>,
}

impl CertHashVerifier {
    pub(crate) fn new(
        hashes: Vec<CertHash>,
        provider: Arc<CryptoProvider>,
        outcome: Arc<CertHashOutcome>,
    ) -> Self {
        Self {
            hashes,
            provider,
            outcome,
        }
    }

    fn find(&self, cert: &CertificateDer<'_>) -> Option<CertHash> {
        let digest = ring::digest::digest(&ring::digest::SHA256, cert.as_ref());
        self.hashes
            .iter()
            .find(|hash| hash.code() == SHA2_256 && hash.digest() == digest.as_ref())
            .copied()
    }
}

impl ServerCertVerifier for CertHashVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(hash) = self.find(end_entity) else {
            debug!(
                pinned = self.hashes.len(),
                "server certificate matches none of the pinned hashes"
            );
            self.outcome.mismatch.store(true, Ordering::Relaxed);
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        };
        check_validity(end_entity, now)?;
        *self.outcome.matched.lock().expect("poisoned") = Some(hash);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::PeerIncompatible(
            rustls::PeerIncompatible::Tls12NotOffered,
        ))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Checks that `cert` is valid at `now` and not valid for longer than [`CERT_VALIDITY`].
fn check_validity(cert: &CertificateDer<'_>, now: UnixTime) -> Result<(), rustls::Error> {
    let (not_before, not_after) = validity(cert).map_err(|err| {
        debug!("malformed server certificate: {err}");
        rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
    })?;
    if now < not_before {
        return Err(rustls::Error::InvalidCertificate(
            CertificateError::NotValidYet,
        ));
    }
    if now > not_after {
        return Err(rustls::Error::InvalidCertificate(CertificateError::Expired));
    }
    let lifetime = not_after.as_secs().saturating_sub(not_before.as_secs());
    if lifetime > CERT_VALIDITY.as_secs() {
        debug!(lifetime, "server certificate is valid for too long");
        return Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ));
    }
    Ok(())
}

/// Reads the `notBefore` and `notAfter` times of a DER encoded X.509 certificate.
fn validity(cert: &CertificateDer<'_>) -> der::Result<(UnixTime, UnixTime)> {
    let mut reader = SliceReader::new(cert.as_ref())?;
    let validity = reader.sequence(|cert| {
        let validity = cert.sequence(|tbs| {
            // explicitly tagged version, absent for v1 certificates
            if matches!(tbs.peek_tag()?, Tag::ContextSpecific { .. }) {
                tbs.tlv_bytes()?;
            }
            // serial number, signature algorithm, issuer
            for _ in 0..3 {
                tbs.tlv_bytes()?;
            }
            let validity = tbs.sequence(|times| Ok((read_time(times)?, read_time(times)?)))?;
            let rest = tbs.remaining_len();
            tbs.read_slice(rest)?;
            Ok(validity)
        })?;
        let rest = cert.remaining_len();
        cert.read_slice(rest)?;
        Ok(validity)
    })?;
    reader.finish(validity)
}

fn read_time<'a, R: Reader<'a>>(reader: &mut R) -> der::Result<UnixTime> {
    let since_epoch = match reader.peek_tag()? {
        Tag::UtcTime => reader.decode::<UtcTime>()?.to_unix_duration(),
        Tag::GeneralizedTime => reader.decode::<GeneralizedTime>()?.to_unix_duration(),
        tag => return Err(tag.unexpected_error(None)),
    };
    Ok(UnixTime::since_unix_epoch(since_epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::crypto_provider;

    fn verify(verifier: &CertHashVerifier, cert: &CertificateDer<'_>) -> bool {
        let name = ServerName::try_from("localhost").unwrap();
        verifier
            .verify_server_cert(cert, &[], &name, &[], UnixTime::now())
            .is_ok()
    }

    #[test]
    fn pins_certificate_hash() {
        let cert = fresh_cert();
        let digest = ring::digest::digest(&ring::digest::SHA256, cert.as_ref());
        let good = CertHash::wrap(SHA2_256, digest.as_ref()).unwrap();
        let decoy = CertHash::wrap(SHA2_256, &[0u8; 32]).unwrap();

        let outcome = Arc::new(CertHashOutcome::default());
        let verifier =
            CertHashVerifier::new(vec![decoy, good], crypto_provider(), outcome.clone());
        assert!(verify(&verifier, &cert));
        assert_eq!(outcome.matched(), Some(good));
        assert!(!outcome.mismatched());

        let outcome = Arc::new(CertHashOutcome::default());
        let verifier = CertHashVerifier::new(vec![decoy], crypto_provider(), outcome.clone());
        assert!(!verify(&verifier, &cert));
        assert_eq!(outcome.matched(), None);
        assert!(outcome.mismatched());
    }

    fn cert_valid_between(
        not_before: time::OffsetDateTime,
        not_after: time::OffsetDateTime,
    ) -> CertificateDer<'static> {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = not_before;
        params.not_after = not_after;
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().clone()
    }

    fn fresh_cert() -> CertificateDer<'static> {
        let now = time::OffsetDateTime::now_utc();
        cert_valid_between(now - time::Duration::hours(1), now + time::Duration::days(13))
    }

    fn pinning(cert: &CertificateDer<'_>) -> (CertHashVerifier, Arc<CertHashOutcome>) {
        let digest = ring::digest::digest(&ring::digest::SHA256, cert.as_ref());
        let hash = CertHash::wrap(SHA2_256, digest.as_ref()).unwrap();
        let outcome = Arc::new(CertHashOutcome::default());
        let verifier = CertHashVerifier::new(vec![hash], crypto_provider(), outcome.clone());
        (verifier, outcome)
    }

    #[test]
    fn reads_validity_window() {
        let not_before = time::OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let not_after = not_before + time::Duration::days(14);
        let cert = cert_valid_between(not_before, not_after);
        let (start, end) = validity(&cert).unwrap();
        assert_eq!(start.as_secs(), 1_700_000_000);
        assert_eq!(end.as_secs(), 1_700_000_000 + 14 * 24 * 60 * 60);

        assert!(validity(&CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x01])).is_err());
    }

    #[test]
    fn rejects_pinned_certificate_outside_validity() {
        let now = time::OffsetDateTime::now_utc();
        let name = ServerName::try_from("localhost").unwrap();

        let expired =
            cert_valid_between(now - time::Duration::days(20), now - time::Duration::days(10));
        let (verifier, outcome) = pinning(&expired);
        let err = verifier
            .verify_server_cert(&expired, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::Expired)
        );
        assert_eq!(outcome.matched(), None);
        assert!(!outcome.mismatched());

        let upcoming =
            cert_valid_between(now + time::Duration::days(1), now + time::Duration::days(5));
        let (verifier, _) = pinning(&upcoming);
        let err = verifier
            .verify_server_cert(&upcoming, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::NotValidYet)
        );

        let long_lived =
            cert_valid_between(now - time::Duration::days(1), now + time::Duration::days(30));
        let (verifier, _) = pinning(&long_lived);
        assert!(!verify(&verifier, &long_lived));

        let fresh = fresh_cert();
        let (verifier, outcome) = pinning(&fresh);
        assert!(verify(&verifier, &fresh));
        assert!(outcome.matched().is_some());
    }

    #[test]
    fn no_hashes_accepts_nothing() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let verifier = CertHashVerifier::new(
            Vec::new(),
            crypto_provider(),
            Arc::new(CertHashOutcome::default()),
        );
        assert!(!verify(&verifier, cert.cert.der()));
    }
}
