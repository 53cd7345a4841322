//! TLS configuration for process-crossing channels.
//!
//! A serving hub presents the chain at `tls_cert_path`; with `verify_peer`
//! it also requires client certificates rooted in that same chain. A
//! connecting hub trusts `tls_cert_path` as its anchor for the upstream.
//! When a verified client certificate is present, its SHA-256 fingerprint
//! becomes the `authenticated_identity` on incoming requests.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
    DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{config::HubConfig, error::HubError};

/// Everything a client side needs to open a TLS channel.
pub(crate) struct TlsClientContext {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

/// Build the client context for connecting to `host`.
///
/// With `verify_peer`, the certificates at `tls_cert_path` are the trust
/// anchors; without it, `insecure` must be set explicitly or the
/// connection is refused before it is attempted.
pub(crate) fn client_context(host: &str, config: &HubConfig) -> Result<TlsClientContext, HubError> {
    let builder = rustls::ClientConfig::builder();
    let builder = if config.verify_peer {
        let mut roots = RootCertStore::empty();
        let path = config.tls_cert_path.as_ref().ok_or_else(|| {
            HubError::Transport("verify_peer requires tls_cert_path as a trust anchor".into())
        })?;
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| HubError::Transport(format!("bad trust anchor: {e}")))?;
        }
        builder.with_root_certificates(roots)
    } else if config.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
    } else {
        return Err(HubError::Transport(
            "refusing unverified TLS: set verify_peer or explicit insecure mode".into(),
        ));
    };

    let client_config = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| HubError::Transport(format!("client certificate rejected: {e}")))?,
        _ => builder.with_no_client_auth(),
    };

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| HubError::Transport(format!("bad server name `{host}`: {e}")))?;
    Ok(TlsClientContext {
        connector: TlsConnector::from(Arc::new(client_config)),
        server_name,
    })
}

/// Build the server-side acceptor, or `None` for a plain-TCP listener.
///
/// Plain TCP is only allowed in explicit `insecure` mode.
pub(crate) fn acceptor(config: &HubConfig) -> Result<Option<TlsAcceptor>, HubError> {
    let (cert_path, key_path) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => {
            if config.insecure {
                return Ok(None);
            }
            return Err(HubError::Transport(
                "refusing to listen unverified: configure TLS or set explicit insecure mode".into(),
            ));
        }
        _ => {
            return Err(HubError::Transport(
                "both tls_cert_path and tls_key_path must be set".into(),
            ));
        }
    };

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = if config.verify_peer {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(cert_path)? {
            roots
                .add(cert)
                .map_err(|e| HubError::Transport(format!("bad trust anchor: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| HubError::Transport(format!("client verifier build failed: {e}")))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| HubError::Transport(format!("server certificate rejected: {e}")))?;

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// SHA-256 fingerprint of a certificate, lowercase hex.
pub(crate) fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert.as_ref());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, HubError> {
    let file = File::open(path)
        .map_err(|e| HubError::Transport(format!("cannot read {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| HubError::Transport(format!("bad certificate in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(HubError::Transport(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, HubError> {
    let file = File::open(path)
        .map_err(|e| HubError::Transport(format!("cannot read {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| HubError::Transport(format!("bad private key in {}: {e}", path.display())))?
        .ok_or_else(|| HubError::Transport(format!("no private key in {}", path.display())))
}

/// Accepts any server certificate. Only reachable in explicit `insecure`
/// mode.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;

    #[test]
    fn unverified_clients_are_refused_without_insecure() {
        let config = HubConfig {
            verify_peer: false,
            ..HubConfig::default()
        };
        assert!(client_context("localhost", &config).is_err());
    }

    #[test]
    fn verify_peer_requires_a_trust_anchor() {
        assert!(client_context("example.com", &HubConfig::default()).is_err());
    }

    #[test]
    fn plain_listeners_require_insecure_mode() {
        assert!(acceptor(&HubConfig::default()).is_err());
        let config = HubConfig {
            insecure: true,
            verify_peer: false,
            ..HubConfig::default()
        };
        assert!(acceptor(&config).unwrap().is_none());
    }

    #[test]
    fn half_configured_tls_is_an_error() {
        let config = HubConfig {
            tls_cert_path: Some("cert.pem".into()),
            ..HubConfig::default()
        };
        assert!(acceptor(&config).is_err());
    }
}
