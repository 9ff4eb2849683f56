//! rustls client configurations for MQTT transports.

use std::io::Cursor;
use std::sync::Arc;

use rumqttc::TlsConfiguration;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{Result, SenderError};

/// Client certificate chain and key.
pub type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Accepts any server certificate. Self-hosted brokers are commonly run
/// with self-signed certificates.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// TLS without server verification, optionally presenting a client identity.
pub fn insecure(identity: Option<Identity>) -> Result<TlsConfiguration> {
    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));

    let config = match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Verified TLS against `ca`, or the bundled web roots when none is given.
pub fn verified(ca: Option<&[u8]>, identity: Option<Identity>) -> Result<TlsConfiguration> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(pem) => {
            for cert in parse_certificates(pem)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Certificates and key from PEM text.
pub fn identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity> {
    Ok((parse_certificates(cert_pem)?, parse_private_key(key_pem)?))
}

/// All certificates in a PEM document.
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SenderError::Tls(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(SenderError::Tls("no certificate found in PEM".to_string()));
    }
    Ok(certs)
}

/// The first private key in a PEM document.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut Cursor::new(pem))
        .map_err(|e| SenderError::Tls(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| SenderError::Tls("no private key found in PEM".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_without_certificates() {
        let err = parse_certificates(b"not a pem").unwrap_err();
        assert_eq!(err.to_string(), "tls configuration error: no certificate found in PEM");
    }

    #[test]
    fn test_pem_without_key() {
        assert!(parse_private_key(b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n").is_err());
    }

    #[test]
    fn test_insecure_config_without_identity() {
        assert!(matches!(insecure(None).unwrap(), TlsConfiguration::Rustls(_)));
    }

    #[test]
    fn test_verified_config_with_web_roots() {
        assert!(matches!(verified(None, None).unwrap(), TlsConfiguration::Rustls(_)));
    }
}
