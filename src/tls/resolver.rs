use std::sync::Arc;

use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::trace;

use crate::cert_manager::CertStore;

/// Serves whichever certificate the [`CertStore`] currently considers valid.
#[derive(Debug)]
pub(crate) struct CertResolver {
    store: Arc<CertStore>,
}

impl CertResolver {
    pub(crate) fn new(store: Arc<CertStore>) -> Self {
        Self { store }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let record = self.store.current();
        trace!(
            server_name = ?client_hello.server_name(),
            index = record.index,
            "serving rotating certificate"
        );
        Some(record.key.clone())
    }
}
