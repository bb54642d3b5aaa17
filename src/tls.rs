// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client TLS
//!
//! Builds the `rustls` client configuration for each [`TlsOptions`] mode and
//! opens the TLS stream `lapin` runs the AMQP connection on.

use crate::{
    config::{TlsMaterial, TlsOptions},
    errors::AmqpError,
};
use lapin::{
    tcp::{HandshakeResult, RustlsConnector, TcpStream},
    uri::AMQPUri,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use std::{io::BufReader, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// PEM label of a PKCS#8 key encrypted with a passphrase
const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Opens the TCP connection to a broker and runs the TLS handshake on it.
pub(crate) type Handshake = Box<dyn FnOnce(&AMQPUri) -> HandshakeResult + Send + Sync>;

/// Accepts any broker certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Builds the client configuration of a TLS mode.
///
/// * `SystemTrust` verifies the broker against the platform trust store.
/// * `NoVerify` accepts any broker certificate.
/// * `Mutual` verifies the broker against the given CA only and presents the
///   client certificate, decrypting the key with the passphrase when needed.
///
/// # Errors
/// `AmqpError::ConfigError` when the PEM material cannot be used.
pub(crate) fn client_config(tls: &TlsOptions) -> Result<ClientConfig, AmqpError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| config_error("unsupported tls protocol versions", err))?;

    match tls {
        TlsOptions::SystemTrust => Ok(builder
            .with_root_certificates(system_roots())
            .with_no_client_auth()),
        TlsOptions::NoVerify => {
            warn!("broker certificate verification is disabled");
            Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
                .with_no_client_auth())
        }
        TlsOptions::Mutual(material) => {
            let mut roots = RootCertStore::empty();
            let (added, _) = roots.add_parsable_certificates(certificates(&material.ca_pem)?);
            if added == 0 {
                return Err(AmqpError::ConfigError(
                    "no usable certificate in the CA file".to_owned(),
                ));
            }

            builder
                .with_root_certificates(roots)
                .with_client_auth_cert(certificates(&material.cert_pem)?, private_key(material)?)
                .map_err(|err| config_error("client certificate rejected", err))
        }
    }
}

/// Connects over TLS with the given configuration, the way `lapin` does for
/// `amqps` URIs.
pub(crate) fn handshake(config: ClientConfig) -> Handshake {
    let connector = RustlsConnector::from(config);

    Box::new(move |uri: &AMQPUri| -> HandshakeResult {
        let address = (uri.authority.host.as_str(), uri.authority.port);
        let stream = match uri.query.connection_timeout {
            Some(timeout) => TcpStream::connect_timeout(address, Duration::from_millis(timeout)),
            None => TcpStream::connect(address),
        }?;

        let stream = stream.into_rustls(&connector, &uri.authority.host)?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    })
}

fn system_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!(added, ignored, "system certificates loaded");
        }
        Err(err) => error!(error = err.to_string(), "failure to load system certificates"),
    }

    roots
}

fn certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, AmqpError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| config_error("invalid certificate pem", err))?;

    if certs.is_empty() {
        return Err(AmqpError::ConfigError("no certificate found in pem".to_owned()));
    }
    Ok(certs)
}

fn private_key(material: &TlsMaterial) -> Result<PrivateKeyDer<'static>, AmqpError> {
    if let Ok((ENCRYPTED_KEY_LABEL, der)) = pem_rfc7468::decode_vec(material.key_pem.as_bytes()) {
        let Some(passphrase) = material.passphrase.as_deref() else {
            return Err(AmqpError::ConfigError(
                "private key is encrypted but no passphrase is set".to_owned(),
            ));
        };

        let info = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice())
            .map_err(|err| config_error("invalid encrypted private key", err))?;
        let key = info
            .decrypt(passphrase)
            .map_err(|err| config_error("failure to decrypt private key", err))?;

        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key.as_bytes().to_vec(),
        )));
    }

    rustls_pemfile::private_key(&mut BufReader::new(material.key_pem.as_bytes()))
        .map_err(|err| config_error("invalid private key pem", err))?
        .ok_or_else(|| AmqpError::ConfigError("no private key found in pem".to_owned()))
}

fn config_error(context: &str, err: impl std::fmt::Display) -> AmqpError {
    error!(error = err.to_string(), context);
    AmqpError::ConfigError(format!("{}: {}", context, err))
}
