// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::{ClientError, CreateClientError};
use async_trait::async_trait;
use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("bad status code: {0}")]
    BadStatus(u16),

    #[error("transport: {0}")]
    Transport(String),

    #[error("terminated")]
    Cancelled,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Transport used for playlist and segment fetches. Implementations
/// must abort in-flight requests when the token fires.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        headers: &[(String, String)],
        token: &CancellationToken,
    ) -> Result<HttpResponse, FetchError>;
}

pub type ArcHttpClient = Arc<dyn HttpClient>;

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(fingerprint: Option<&str>) -> Result<Self, CreateClientError> {
        let tls = match fingerprint {
            Some(fingerprint) => {
                // Validity of the hex string is checked up front so a
                // typo fails the session instead of every handshake.
                hex::decode(fingerprint)?;
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(FingerprintVerifier {
                        fingerprint: fingerprint.to_lowercase(),
                    }))
                    .with_no_client_auth()
            }
            None => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|e| CreateClientError::Http(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(
        &self,
        url: &Url,
        headers: &[(String, String)],
        token: &CancellationToken,
    ) -> Result<HttpResponse, FetchError> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            () = token.cancelled() => return Err(FetchError::Cancelled),
            res = request.send() => res.map_err(|e| FetchError::Transport(e.to_string()))?,
        };
        let status = response.status().as_u16();

        let body = tokio::select! {
            () = token.cancelled() => return Err(FetchError::Cancelled),
            res = response.bytes() => res.map_err(|e| FetchError::Transport(e.to_string()))?,
        };

        Ok(HttpResponse { status, body })
    }
}

/// Accepts exactly the certificate whose SHA-256 digest matches the
/// configured fingerprint, bypassing chain validation.
#[derive(Debug)]
pub(crate) struct FingerprintVerifier {
    pub(crate) fingerprint: String,
}

impl FingerprintVerifier {
    fn check(&self, end_entity: &CertificateDer) -> Result<(), rustls::Error> {
        let digest = hex::encode(Sha256::digest(end_entity.as_ref()));
        if digest == self.fingerprint {
            Ok(())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: {digest}"
            )))
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Fetches one playlist or segment, accepting full and partial
/// content responses.
pub async fn fetch_bytes(
    http: &ArcHttpClient,
    url: &Url,
    byte_range: Option<(u64, u64)>,
    token: &CancellationToken,
) -> Result<Bytes, ClientError> {
    let headers = match byte_range {
        // Range is inclusive of the last byte.
        Some((offset, length)) if length != 0 => vec![(
            "Range".to_owned(),
            format!("bytes={}-{}", offset, offset + length - 1),
        )],
        _ => Vec::new(),
    };

    let response = http.get(url, &headers, token).await?;
    if response.status != 200 && response.status != 206 {
        return Err(ClientError::Fetch(FetchError::BadStatus(response.status)));
    }
    Ok(response.body)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_case::test_case;

    // Self-signed certificate DER is irrelevant, only the digest matters.
    const TEST_DER: &[u8] = b"test certificate der";

    #[test_case(true; "lowercase")]
    #[test_case(false; "uppercase")]
    fn test_fingerprint_match_is_case_insensitive(lowercase: bool) {
        let digest = hex::encode(Sha256::digest(TEST_DER));
        let configured = if lowercase {
            digest
        } else {
            digest.to_uppercase()
        };

        let verifier = FingerprintVerifier {
            fingerprint: configured.to_lowercase(),
        };
        let cert = CertificateDer::from(TEST_DER.to_vec());
        assert!(verifier.check(&cert).is_ok());
    }

    #[test]
    fn test_fingerprint_mismatch() {
        let verifier = FingerprintVerifier {
            fingerprint: hex::encode(Sha256::digest(b"other certificate")),
        };
        let cert = CertificateDer::from(TEST_DER.to_vec());
        assert!(verifier.check(&cert).is_err());
    }
}
