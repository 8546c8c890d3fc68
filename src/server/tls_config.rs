//! TLS material for `wss` listeners.

use crate::config::ServerConfig;
use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::info;

/// Builds the rustls acceptor config when `use_tls` is set, or `None` for a
/// plain `ws` server.
pub(crate) fn server_tls_config(
    config: &ServerConfig,
) -> Result<Option<Arc<rustls::ServerConfig>>, Error> {
    if !config.use_tls {
        return Ok(None);
    }
    let (Some(cert_path), Some(key_path)) = (&config.tls_server_cert, &config.tls_server_key)
    else {
        return Err(Error::TlsServerConfigMissing);
    };

    let cert_chain = read_cert_chain(cert_path)?;
    let key = read_private_key(key_path)?;
    info!(%cert_path, certificates = cert_chain.len(), "Loaded TLS certificate chain");

    let tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
    Ok(Some(Arc::new(tls)))
}

fn open(path: &str) -> std::io::Result<BufReader<File>> {
    File::open(path).map(BufReader::new)
}

fn read_cert_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = open(path).map_err(|source| Error::TlsCertificateLoad {
        path: path.to_string(),
        source,
    })?;
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("{path}: {e}")))?;
    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "{path}: no PEM certificates"
        )));
    }
    Ok(chain)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = open(path).map_err(|source| Error::TlsKeyLoad {
        path: path.to_string(),
        source,
    })?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::TlsInvalidKey(format!("{path}: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("{path}: no PEM private key")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn tls_config(cert: &NamedTempFile, key: &NamedTempFile) -> ServerConfig {
        ServerConfig {
            use_tls: true,
            tls_server_cert: Some(cert.path().to_str().unwrap().to_string()),
            tls_server_key: Some(key.path().to_str().unwrap().to_string()),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn plain_server_needs_no_material() {
        assert!(server_tls_config(&ServerConfig::default()).unwrap().is_none());
    }

    #[test]
    fn loads_generated_certificate() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert = write_temp(&certified.cert.pem());
        let key = write_temp(&certified.key_pair.serialize_pem());

        assert!(server_tls_config(&tls_config(&cert, &key)).unwrap().is_some());
    }

    #[test]
    fn missing_paths_are_reported() {
        let config = ServerConfig {
            use_tls: true,
            tls_server_cert: Some("cert.pem".to_string()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            server_tls_config(&config),
            Err(Error::TlsServerConfigMissing)
        ));
    }

    #[test]
    fn missing_files_are_reported() {
        let config = ServerConfig {
            use_tls: true,
            tls_server_cert: Some("/nonexistent/cert.pem".to_string()),
            tls_server_key: Some("/nonexistent/key.pem".to_string()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            server_tls_config(&config),
            Err(Error::TlsCertificateLoad { .. })
        ));
    }

    #[test]
    fn empty_files_are_rejected() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert = write_temp(&certified.cert.pem());
        let empty = write_temp("");

        assert!(matches!(
            server_tls_config(&tls_config(&empty, &empty)),
            Err(Error::TlsInvalidCertificate(_))
        ));
        assert!(matches!(
            server_tls_config(&tls_config(&cert, &empty)),
            Err(Error::TlsInvalidKey(_))
        ));
    }
}
