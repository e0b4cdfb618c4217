//! TLS client setup for HSM sockets.
//!
//! Trust is anchored on a PEM CA bundle; client certificates are not used.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::info;

use hsm_common::{HsmError, HsmResult};

/// Loads every certificate in a PEM bundle into a root store.
pub fn load_root_store(ca_path: &Path) -> HsmResult<RootCertStore> {
    let file = File::open(ca_path)
        .map_err(|e| HsmError::Config(format!("{}: {}", ca_path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HsmError::Config(format!("{}: {}", ca_path.display(), e)))?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| HsmError::Config(format!("invalid CA certificate: {e}")))?;
    }

    if roots.is_empty() {
        return Err(HsmError::Config(format!(
            "{}: no CA certificates found",
            ca_path.display()
        )));
    }

    info!(ca_file = %ca_path.display(), cert_count = roots.len(), "loaded HSM trust roots");
    Ok(roots)
}

/// Builds a connector that verifies HSM certificates against `ca_path`.
pub fn build_connector(ca_path: &Path) -> HsmResult<TlsConnector> {
    let roots = load_root_store(ca_path)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Converts a host name or IP literal into a rustls server name.
pub fn server_name(host: &str) -> HsmResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| HsmError::Config(format!("invalid TLS server name {host}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_and_ip_server_names() {
        assert!(server_name("hsm01.internal").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("").is_err());
    }

    #[test]
    fn missing_bundle_is_config_error() {
        let err = load_root_store(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, HsmError::Config(_)));
    }

    #[test]
    fn bundle_without_certificates_is_rejected() {
        let path = std::env::temp_dir().join(format!("hsm-empty-ca-{}.pem", std::process::id()));
        std::fs::write(&path, "not a certificate\n").unwrap();
        let err = load_root_store(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(err, HsmError::Config(ref msg) if msg.contains("no CA certificates")));
    }
}
