//! Mutual-TLS client configuration for HTTPS Incus endpoints.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::backend::TlsMaterial;
use crate::error::{Error, Result};

fn tls_error(e: rustls::Error) -> Error {
    Error::Transport(format!("tls: {}", e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Io(e).context(format!("open certificate {}", path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Protocol(format!("parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Protocol(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Io(e).context(format!("open key {}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Protocol(format!("parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Protocol(format!("no private key in {}", path.display())))
}

/// Build the client config. A configured server certificate is pinned
/// byte-for-byte; otherwise the system trust store verifies the server.
pub fn client_config(material: &TlsMaterial) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let builder = if !material.server_cert.is_empty() && Path::new(&material.server_cert).exists()
    {
        let pinned = load_certs(Path::new(&material.server_cert))?.remove(0);
        debug!(server_cert = %material.server_cert, "incus:tls pinned server certificate");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerCert { pinned, provider }))
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            warn!(error = %e, "incus:tls native certificate load error");
        }
        let (added, _ignored) = roots.add_parsable_certificates(native.certs);
        debug!(added, "incus:tls system roots");
        builder.with_root_certificates(roots)
    };

    let certs = load_certs(Path::new(&material.client_cert))?;
    let key = load_key(Path::new(&material.client_key))?;
    let config = builder
        .with_client_auth_cert(certs, key)
        .map_err(tls_error)?;
    Ok(config)
}

/// Accepts exactly one server certificate. Incus servers use self-signed
/// certificates, so chain and hostname validation do not apply.
#[derive(Debug)]
struct PinnedServerCert {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match the pinned certificate".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
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
