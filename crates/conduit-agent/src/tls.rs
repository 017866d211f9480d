//! Client TLS configuration for the management endpoint.
//!
//! Only built when the endpoint URL is `wss://` and something differs from
//! the defaults (custom root CA, server name override or insecure mode);
//! otherwise tokio-tungstenite's built-in webpki roots are used.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::TlsSettings;
use crate::error::ConfigError;

/// Build the endpoint's client config, or `None` to use the defaults.
pub fn endpoint_client_config(
    settings: &TlsSettings,
) -> Result<Option<Arc<ClientConfig>>, ConfigError> {
    if !settings.insecure && settings.root_ca.is_none() && settings.server_name.is_none() {
        return Ok(None);
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    if settings.insecure {
        let verifier = AcceptAnyCertificate { provider };
        let config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        return Ok(Some(Arc::new(config)));
    }

    let roots = Arc::new(root_store(settings)?);
    let config = match &settings.server_name {
        Some(name) => {
            let inner = WebPkiServerVerifier::builder_with_provider(Arc::clone(&roots), provider)
                .build()
                .map_err(|e| ConfigError::Tls(e.to_string()))?;
            let name = ServerName::try_from(name.clone())
                .map_err(|_| ConfigError::ServerName(name.clone()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ExpectedName { inner, name }))
                .with_no_client_auth()
        }
        None => builder
            .with_root_certificates(Arc::unwrap_or_clone(roots))
            .with_no_client_auth(),
    };
    Ok(Some(Arc::new(config)))
}

/// The configured CA alone, or the webpki roots when none is configured.
fn root_store(settings: &TlsSettings) -> Result<RootCertStore, ConfigError> {
    let Some(path) = &settings.root_ca else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };
    let ca_error = |reason: String| ConfigError::RootCa {
        path: path.display().to_string(),
        reason,
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| ca_error(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ca_error(e.to_string()))?;
    if certs.is_empty() {
        return Err(ca_error("no certificates found".into()));
    }
    let mut store = RootCertStore::empty();
    let (added, _ignored) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ca_error("no usable certificates".into()));
    }
    Ok(store)
}

/// Verifies the chain as usual but against a fixed name.
#[derive(Debug)]
struct ExpectedName {
    inner: Arc<WebPkiServerVerifier>,
    name: ServerName<'static>,
}

impl ServerCertVerifier for ExpectedName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any certificate chain; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_need_no_custom_config() {
        assert!(
            endpoint_client_config(&TlsSettings::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn insecure_mode_builds_config() {
        let settings = TlsSettings {
            insecure: true,
            ..Default::default()
        };
        assert!(endpoint_client_config(&settings).unwrap().is_some());
    }

    #[test]
    fn server_name_override_builds_config() {
        let settings = TlsSettings {
            server_name: Some("mc.internal".into()),
            ..Default::default()
        };
        assert!(endpoint_client_config(&settings).unwrap().is_some());
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let settings = TlsSettings {
            root_ca: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(
            endpoint_client_config(&settings),
            Err(ConfigError::RootCa { .. })
        ));
    }

    #[test]
    fn ca_file_without_certificates_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let settings = TlsSettings {
            root_ca: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            endpoint_client_config(&settings),
            Err(ConfigError::RootCa { .. })
        ));
    }
}
