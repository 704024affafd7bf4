// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::Cursor;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::warn;

use crate::config::{ClusterConfig, RootCert};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid root certificate: {0}")]
    InvalidRootCert(String),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
}

#[cfg(feature = "tls-ring")]
pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(feature = "tls-aws-lc")]
pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidRootCert(e.to_string()))?;
    if certs.is_empty() {
        return Err(Error::InvalidRootCert(
            "no PEM certificates found".to_string(),
        ));
    }
    Ok(certs)
}

async fn root_to_store(root_cert: &RootCert) -> Result<rustls::RootCertStore, Error> {
    let mut roots = rustls::RootCertStore::empty();
    match root_cert {
        RootCert::File(f) => {
            let certfile = tokio::fs::read(f)
                .await
                .map_err(|e| Error::InvalidRootCert(format!("{}: {e}", f.display())))?;
            roots.add_parsable_certificates(pem_certs(&certfile)?);
        }
        RootCert::Static(b) => {
            roots.add_parsable_certificates(pem_certs(b)?);
        }
        RootCert::Default => {
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                warn!("failed loading platform root certificate: {e}");
            }
            if native.certs.is_empty() {
                // Plain http servers still work; https ones will fail verification.
                warn!("no platform root certificates available");
            }
            roots.add_parsable_certificates(native.certs);
        }
    };
    Ok(roots)
}

/// TLS settings for talking to the API server.
pub async fn client_config(cluster: &ClusterConfig) -> Result<ClientConfig, Error> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let cc = if cluster.insecure_skip_tls_verify {
        warn!(server = %cluster.server, "server certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_to_store(&cluster.root_cert).await?)
            .with_no_client_auth()
    };
    Ok(cc)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct InsecureVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureVerifier {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
