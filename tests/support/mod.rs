// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the integration tests: a throwaway self-signed
//! cert/key pair per test process, plus a client-side `TlsConnector` that
//! accepts it (the loopback equivalent of each test's own private CA).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use bumper::config::Settings;
use bumper::tls;

static NEXT_PORT: AtomicU16 = AtomicU16::new(19100);

/// Returns a fresh loopback port for each test, avoiding collisions between
/// tests that run concurrently in the same process.
pub fn test_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Writes a throwaway self-signed certificate/key pair to a new scratch
/// directory under the OS temp dir, returning the directory.
pub fn write_test_certs() -> PathBuf {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).expect("self-signed cert generation");

    let dir = std::env::temp_dir().join(format!("bumper-test-certs-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create cert scratch dir");
    std::fs::write(dir.join("cert.crt"), cert.pem()).expect("write cert");
    std::fs::write(dir.join("key.pem"), key_pair.serialize_pem()).expect("write key");
    std::fs::write(dir.join("ca.crt"), cert.pem()).expect("write ca");
    dir
}

/// A minimal [`Settings`] pointing at a fresh cert dir and the given ports,
/// with an in-process data dir alongside it.
pub fn test_settings(listen: &str, mqtt_port: u16, xmpp_port: u16) -> Settings {
    let certs_dir = write_test_certs();
    let data_dir = std::env::temp_dir().join(format!("bumper-test-data-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&data_dir).expect("create data scratch dir");

    Settings {
        listen: listen.to_string(),
        announce_ip: listen.to_string(),
        data_dir,
        certs_dir,
        mqtt_port,
        xmpp_port,
        use_auth: false,
        token_validity_seconds: 3600,
        oauth_validity_days: 15,
        proxy_mqtt: false,
        proxy_mqtt_host: "mq-ww.ecouser.net".to_string(),
        debug: false,
    }
}

/// Builds a client-side [`TlsConnector`] that accepts any server
/// certificate, the loopback counterpart to `write_test_certs`' throwaway CA.
pub fn test_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Loads a [`tokio_rustls::TlsAcceptor`] for `settings`' cert/key pair, via
/// the same loader the real server uses.
pub fn test_acceptor(settings: &Settings) -> tokio_rustls::TlsAcceptor {
    tls::load_acceptor(settings).expect("load test acceptor")
}

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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
