// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared TLS configuration for the MQTT and XMPP listeners.
//!
//! Both listeners terminate TLS with the same certificate/key pair, loaded
//! once at startup and shared via [`tokio_rustls::TlsAcceptor`]. Building
//! and validating the certificate/key material itself is out of scope here
//! (the operator provisions `ca.crt`/`cert.crt`/`key.pem`); this module only
//! wires the already-issued files into a `rustls::ServerConfig`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::Settings;
use crate::error::{ConfigError, Error, Result};

/// Builds a [`TlsAcceptor`] from the certificate and key configured in
/// `settings`, to be shared by the MQTT and XMPP listeners.
pub fn load_acceptor(settings: &Settings) -> Result<TlsAcceptor> {
    let certs = load_certs(&settings.cert_path())?;
    let key = load_private_key(&settings.key_path())?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Fatal(format!("invalid certificate/key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|source| ConfigError::UnreadableFile {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|source| {
            Error::Config(ConfigError::UnreadableFile {
                path: path.display().to_string(),
                source,
            })
        })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|source| ConfigError::UnreadableFile {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| {
            Error::Config(ConfigError::UnreadableFile {
                path: path.display().to_string(),
                source,
            })
        })?
        .ok_or_else(|| Error::Fatal(format!("no private key found in {}", path.display())))
}
