// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime configuration, loaded from environment variables with CLI
//! overrides (see [`crate::bin`] for the CLI surface).

use std::path::PathBuf;

use crate::error::{ConfigError, Result};

/// Default MQTT TLS listen port.
pub const DEFAULT_MQTT_PORT: u16 = 8883;
/// Default XMPP TLS listen port.
pub const DEFAULT_XMPP_PORT: u16 = 5223;
/// Default HTTPS gateway port (bridge endpoints only; server itself is out of scope).
pub const DEFAULT_HTTPS_PORT: u16 = 443;
/// Default admin/debug port.
pub const DEFAULT_ADMIN_PORT: u16 = 8007;

/// Fully resolved server configuration.
///
/// Mirrors the environment variables read by the original implementation's
/// startup routine: `BUMPER_LISTEN`, `BUMPER_ANNOUNCE_IP`, `BUMPER_DATA`,
/// `BUMPER_CERTS`, `BUMPER_CA`, `BUMPER_CERT`, `BUMPER_KEY`, `BUMPER_DEBUG`,
/// plus the proxy-mode toggles.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the MQTT and XMPP listeners bind to.
    pub listen: String,
    /// Address advertised to clients (defaults to `listen` when unset).
    pub announce_ip: String,
    /// Directory holding the identity store and password file.
    pub data_dir: PathBuf,
    /// Directory holding `ca.crt`, `cert.crt`, `key.pem`.
    pub certs_dir: PathBuf,
    /// MQTT TLS listen port.
    pub mqtt_port: u16,
    /// XMPP TLS listen port.
    pub xmpp_port: u16,
    /// Whether devices require an authcode to connect over MQTT.
    pub use_auth: bool,
    /// Token validity window, in seconds.
    pub token_validity_seconds: i64,
    /// OAuth grant validity window, in days.
    pub oauth_validity_days: i64,
    /// When set, device MQTT sessions are bridged to the real vendor broker.
    pub proxy_mqtt: bool,
    /// Hostname of the vendor MQTT broker used in proxy mode.
    pub proxy_mqtt_host: String,
    /// Enables verbose debug logging.
    pub debug: bool,
}

impl Settings {
    /// Path to the CA certificate.
    #[must_use]
    pub fn ca_path(&self) -> PathBuf {
        self.certs_dir.join("ca.crt")
    }

    /// Path to the server certificate.
    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.certs_dir.join("cert.crt")
    }

    /// Path to the server private key.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.certs_dir.join("key.pem")
    }

    /// Path to the bcrypt password file used as an auth fallback.
    #[must_use]
    pub fn password_file_path(&self) -> PathBuf {
        self.data_dir.join("passwd")
    }

    /// Path to the identity store's on-disk database.
    #[must_use]
    pub fn identity_db_path(&self) -> PathBuf {
        self.data_dir.join("bumper.db")
    }

    /// Loads settings from environment variables, applying the same defaults
    /// as the original implementation's `bumper/__init__.py`.
    pub fn from_env() -> Result<Self> {
        let listen = std::env::var("BUMPER_LISTEN")
            .map_err(|_| ConfigError::Missing("BUMPER_LISTEN".to_string()))?;
        let announce_ip = std::env::var("BUMPER_ANNOUNCE_IP").unwrap_or_else(|_| listen.clone());
        let data_dir = std::env::var("BUMPER_DATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        let certs_dir = std::env::var("BUMPER_CERTS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("certs"));

        Ok(Self {
            listen,
            announce_ip,
            data_dir,
            certs_dir,
            mqtt_port: DEFAULT_MQTT_PORT,
            xmpp_port: DEFAULT_XMPP_PORT,
            use_auth: parse_bool_env("BUMPER_USE_AUTH", false),
            token_validity_seconds: 3600,
            oauth_validity_days: 15,
            proxy_mqtt: parse_bool_env("BUMPER_PROXY_MQTT", false),
            proxy_mqtt_host: std::env::var("BUMPER_PROXY_MQTT_HOST")
                .unwrap_or_else(|_| "mq-ww.ecouser.net".to_string()),
            debug: parse_bool_env("BUMPER_DEBUG", false),
        })
    }
}

fn parse_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Some(true),
            "0" | "false" | "no" | "n" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}
