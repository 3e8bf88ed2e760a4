use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{RscError, RscResult};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Hex-encoded SHA-256 of a DER certificate, the form used for pinning.
pub fn fingerprint(cert: &[u8]) -> String {
    hex::encode(Sha256::digest(cert))
}

/// Accepts exactly one server certificate, identified by the SHA-256 of its
/// DER encoding. Chain building and name checks are replaced by the pin;
/// handshake signatures are still verified against the pinned key.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pin: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(pin_hex: &str) -> RscResult<Self> {
        let pin = hex::decode(pin_hex.trim().replace(':', ""))
            .map_err(|err| RscError::config(format!("invalid certificate pin: {err}")))?;
        if pin.len() != 32 {
            return Err(RscError::config(
                "certificate pin must be a SHA-256 digest (64 hex characters)",
            ));
        }
        Ok(Self {
            pin,
            provider: provider(),
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.pin.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!(
                presented = %hex::encode(digest),
                "server certificate does not match pinned fingerprint"
            );
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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

pub fn client_config(pin_hex: &str) -> RscResult<rustls::ClientConfig> {
    let verifier = PinnedCertVerifier::new(pin_hex)?;
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(RscError::tls)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> RscResult<rustls::ServerConfig> {
    rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(RscError::tls)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(RscError::tls)
}

pub fn load_certs(path: &Path) -> RscResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|err| {
        RscError::config(format!("failed to open certificate {}: {err}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| RscError::config(format!("invalid certificate PEM: {err}")))?;
    if certs.is_empty() {
        return Err(RscError::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> RscResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|err| {
        RscError::config(format!("failed to open private key {}: {err}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| RscError::config(format!("invalid private key PEM: {err}")))?
        .ok_or_else(|| RscError::config(format!("no private key found in {}", path.display())))
}

/// Name presented for SNI. The pin, not the name, authenticates the server.
pub fn server_name(addr: &str) -> RscResult<ServerName<'static>> {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .map_err(|err| RscError::config(format!("invalid server address {addr}: {err}")))
}
