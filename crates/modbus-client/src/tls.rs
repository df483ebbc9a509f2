use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::{ClientError, TlsConfig};

pub(crate) fn connector(config: &TlsConfig) -> Result<TlsConnector, ClientError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_file {
        let file = File::open(path)
            .map_err(|err| ClientError::Tls(format!("open ca file {path}: {err}")))?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert.map_err(|err| ClientError::Tls(format!("read ca file {path}: {err}")))?;
            roots
                .add(cert)
                .map_err(|err| ClientError::Tls(format!("load ca file {path}: {err}")))?;
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| ClientError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls)))
}

/// SNI name: the configured override, else the host itself (IP literals allowed).
pub(crate) fn server_name(config: &TlsConfig, host: &str) -> Result<ServerName<'static>, ClientError> {
    let name = config.server_name.clone().unwrap_or_else(|| host.to_string());
    ServerName::try_from(name).map_err(|err| ClientError::Tls(format!("invalid server name: {err}")))
}
