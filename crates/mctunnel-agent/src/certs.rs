//! Trusted root certificates for dialing target services.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rustls::RootCertStore;
use tracing::debug;

use crate::error::CertError;

/// Default CA bundle mounted into Kubernetes pods.
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Install the process-wide rustls crypto provider exactly once.
pub(crate) fn ensure_crypto_provider() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Supplies the root CA pool the proxy trusts when dialing targets.
pub trait CertificateProvider: Send + Sync {
    fn root_store(&self) -> Result<RootCertStore, CertError>;
}

/// Loads a PEM bundle from disk, by default the in-cluster service
/// account CA.
#[derive(Debug, Clone)]
pub struct FileCertificateProvider {
    path: PathBuf,
}

impl FileCertificateProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for FileCertificateProvider {
    fn default() -> Self {
        Self::new(SERVICE_ACCOUNT_CA_PATH)
    }
}

impl CertificateProvider for FileCertificateProvider {
    fn root_store(&self) -> Result<RootCertStore, CertError> {
        load_pem_roots(&self.path)
    }
}

/// Trusts the Mozilla root program. Useful when targets carry publicly
/// issued certificates.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebpkiCertificateProvider;

impl CertificateProvider for WebpkiCertificateProvider {
    fn root_store(&self) -> Result<RootCertStore, CertError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Ok(roots)
    }
}

fn load_pem_roots(path: &Path) -> Result<RootCertStore, CertError> {
    let file = std::fs::File::open(path).map_err(|source| CertError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut roots = RootCertStore::empty();
    let mut count = 0usize;

    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|source| CertError::Read {
            path: path.display().to_string(),
            source,
        })?;
        roots.add(cert).map_err(|err| CertError::Invalid {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        count += 1;
    }

    if count == 0 {
        return Err(CertError::Empty(path.display().to_string()));
    }

    debug!(path = %path.display(), certificates = count, "Loaded root CA bundle");
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_bundle_is_an_error() {
        let provider = FileCertificateProvider::new("/nonexistent/ca.crt");
        assert!(matches!(
            provider.root_store(),
            Err(CertError::Read { .. })
        ));
    }

    #[test]
    fn test_empty_bundle_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate").unwrap();

        let provider = FileCertificateProvider::new(file.path());
        assert!(matches!(provider.root_store(), Err(CertError::Empty(_))));
    }

    #[test]
    fn test_webpki_roots_are_nonempty() {
        let roots = WebpkiCertificateProvider.root_store().unwrap();
        assert!(!roots.is_empty());
    }
}
