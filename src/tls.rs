//! Client TLS configuration from a pinned server certificate.

use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;

use crate::error::{Error, Result};

/// Builds a TLS 1.3 client config whose only trust anchors are the
/// certificates in `certfile`. Verification stays on; the pinned
/// certificate is the root of trust, not a reason to skip checking.
pub fn client_config(certfile: &Path) -> Result<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    let mut loaded = 0usize;
    for cert in CertificateDer::pem_file_iter(certfile)? {
        roots.add(cert?)?;
        loaded += 1;
    }
    if loaded == 0 {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            certfile.display()
        )));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_an_error() {
        assert!(client_config(Path::new("/nonexistent/cert.pem")).is_err());
    }

    #[test]
    fn empty_pem_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        assert!(client_config(file.path()).is_err());
    }
}
