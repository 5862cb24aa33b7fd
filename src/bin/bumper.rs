// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI entrypoint: loads settings from the environment (with CLI overrides)
//! and runs the server until interrupted.

use std::path::PathBuf;

use bumper::config::{Settings, DEFAULT_MQTT_PORT, DEFAULT_XMPP_PORT};
use bumper::error::{ConfigError, Result};
use bumper::server::Server;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Local drop-in replacement for the vendor cloud of consumer robot vacuums.
#[derive(Debug, Parser)]
#[command(name = "bumper", version, about)]
struct Cli {
    /// Address the MQTT and XMPP listeners bind to.
    #[arg(long, env = "BUMPER_LISTEN")]
    listen: Option<String>,

    /// Address advertised to clients (defaults to `--listen`).
    #[arg(long, env = "BUMPER_ANNOUNCE_IP")]
    announce_ip: Option<String>,

    /// Directory holding the identity store and password file.
    #[arg(long, env = "BUMPER_DATA", default_value = "data")]
    data_dir: PathBuf,

    /// Directory holding `ca.crt`, `cert.crt`, `key.pem`.
    #[arg(long, env = "BUMPER_CERTS", default_value = "certs")]
    certs_dir: PathBuf,

    /// MQTT TLS listen port.
    #[arg(long, default_value_t = DEFAULT_MQTT_PORT)]
    mqtt_port: u16,

    /// XMPP TLS listen port.
    #[arg(long, default_value_t = DEFAULT_XMPP_PORT)]
    xmpp_port: u16,

    /// Require devices to present a valid authcode/token over MQTT.
    #[arg(long, env = "BUMPER_USE_AUTH")]
    use_auth: bool,

    /// Bridge device MQTT sessions to the real vendor broker.
    #[arg(long, env = "BUMPER_PROXY_MQTT")]
    proxy_mqtt: bool,

    /// Hostname of the vendor MQTT broker used in proxy mode.
    #[arg(long, env = "BUMPER_PROXY_MQTT_HOST", default_value = "mq-ww.ecouser.net")]
    proxy_mqtt_host: String,

    /// Enables verbose debug logging.
    #[arg(long, env = "BUMPER_DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let env_settings = Settings::from_env();
    let listen = cli
        .listen
        .or_else(|| env_settings.as_ref().ok().map(|s| s.listen.clone()))
        .ok_or(ConfigError::Missing("BUMPER_LISTEN".to_string()))?;
    let announce_ip = cli.announce_ip.unwrap_or_else(|| listen.clone());

    let settings = Settings {
        listen,
        announce_ip,
        data_dir: cli.data_dir,
        certs_dir: cli.certs_dir,
        mqtt_port: cli.mqtt_port,
        xmpp_port: cli.xmpp_port,
        use_auth: cli.use_auth,
        token_validity_seconds: 3600,
        oauth_validity_days: 15,
        proxy_mqtt: cli.proxy_mqtt,
        proxy_mqtt_host: cli.proxy_mqtt_host,
        debug: cli.debug,
    };

    let server = Server::build(settings).await?;
    server.run().await?;
    Ok(())
}
