//! TLS transport for broker connections.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use mqttgate_core::{ConnectionSettings, Error, Result};
use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

/// Transport for `settings`, or `None` for plain TCP.
pub fn transport_for(settings: &ConnectionSettings) -> Result<Option<Transport>> {
    if !settings.ssl {
        return Ok(None);
    }
    let config = client_config(settings)?;
    Ok(Some(Transport::tls_with_config(TlsConfiguration::Rustls(
        Arc::new(config),
    ))))
}

fn client_config(settings: &ConnectionSettings) -> Result<ClientConfig> {
    let builder = ClientConfig::builder();

    let builder = if settings.insecure {
        tracing::warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    } else {
        builder.with_root_certificates(root_store(settings.ca_certs.as_deref())?)
    };

    match (&settings.certfile, &settings.keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let chain = load_certs(certfile)?;
            let key = load_key(keyfile)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| Error::InvalidConfig(format!("client certificate: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(Error::InvalidConfig(
            "certfile and keyfile must be given together".to_string(),
        )),
    }
}

fn root_store(ca_certs: Option<&str>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_certs {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::InvalidConfig(format!("CA certificate '{}': {}", path, e)))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| Error::Transport(format!("failed to load system roots: {}", e)))?;
            let (added, ignored) = roots.add_parsable_certificates(native);
            tracing::debug!(added, ignored, "Loaded system root certificates");
        }
    }
    Ok(roots)
}

fn open(path: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::InvalidConfig(format!("cannot open '{}': {}", path, e)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidConfig(format!("invalid PEM in '{}': {}", path, e)))?;
    if certs.is_empty() {
        return Err(Error::InvalidConfig(format!("no certificates in '{}'", path)));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::InvalidConfig(format!("invalid PEM in '{}': {}", path, e)))?
        .ok_or_else(|| Error::InvalidConfig(format!("no private key in '{}'", path)))
}

/// Accepts any server certificate. Only used with `insecure`.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
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
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_tcp_without_ssl() {
        let settings = ConnectionSettings::default();
        assert!(transport_for(&settings).unwrap().is_none());
    }

    #[test]
    fn test_insecure_tls_builds() {
        let settings = ConnectionSettings {
            ssl: true,
            insecure: true,
            ..ConnectionSettings::default()
        };
        assert!(matches!(transport_for(&settings), Ok(Some(Transport::Tls(_)))));
    }

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let settings = ConnectionSettings {
            ssl: true,
            ca_certs: Some("/nonexistent/ca.pem".to_string()),
            ..ConnectionSettings::default()
        };
        assert!(matches!(transport_for(&settings), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_half_client_auth_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("client.pem");
        std::fs::write(&cert, "").unwrap();
        let settings = ConnectionSettings {
            ssl: true,
            insecure: true,
            certfile: Some(cert.to_string_lossy().into_owned()),
            ..ConnectionSettings::default()
        };
        assert!(matches!(transport_for(&settings), Err(Error::InvalidConfig(_))));
    }
}
