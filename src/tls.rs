//! Optional TLS for the wire listener. Clients negotiate it through the
//! usual postgres SSLRequest handshake.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::ServerConfig;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.into())
}

fn read_chain(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(invalid(format!("{}: no certificates", path.display())));
    }
    Ok(chain)
}

fn read_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?
        .ok_or_else(|| invalid(format!("{}: no private key", path.display())))
}

/// `None` when TLS is not configured. A certificate without a key (or the
/// reverse) is a startup error rather than a silent plaintext fallback.
pub fn acceptor(config: &ServerConfig) -> io::Result<Option<TlsAcceptor>> {
    let (cert, key) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(cert), Some(key)) => (Path::new(cert), Path::new(key)),
        _ => return Err(invalid("CREWPLAN_TLS_CERT and CREWPLAN_TLS_KEY go together")),
    };

    let mut server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_chain(cert)?, read_key(key)?)
        .map_err(|e| invalid(e.to_string()))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!(cert = %cert.display(), "tls enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_without_files() {
        assert!(acceptor(&ServerConfig::default()).unwrap().is_none());
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let config = ServerConfig {
            tls_cert: Some("server.crt".into()),
            ..ServerConfig::default()
        };
        let err = acceptor(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_certificate_file() {
        let config = ServerConfig {
            tls_cert: Some("/nonexistent/crewplan.crt".into()),
            tls_key: Some("/nonexistent/crewplan.key".into()),
            ..ServerConfig::default()
        };
        let err = acceptor(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let dir = std::env::temp_dir().join("crewplan_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let pem = dir.join("empty.pem");
        std::fs::write(&pem, "").unwrap();
        let config = ServerConfig {
            tls_cert: Some(pem.display().to_string()),
            tls_key: Some(pem.display().to_string()),
            ..ServerConfig::default()
        };
        let err = acceptor(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
