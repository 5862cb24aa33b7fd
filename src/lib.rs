// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bumper - a local drop-in replacement for the vendor cloud of consumer
//! robot vacuums.
//!
//! Robot vacuums from this vendor family phone home to a fixed set of
//! cloud hosts for three things: an MQTT broker carrying device commands
//! and telemetry, an XMPP-like stream carrying app-to-device signalling,
//! and a REST API fronting both. This crate reimplements the MQTT broker
//! and XMPP-like server so those devices (and the vendor's companion app)
//! can be pointed at a host on the local network instead, with no
//! connectivity to the vendor's infrastructure required.
//!
//! # Modules
//!
//! - [`identity`] - users, app clients, bots, tokens, and OAuth grants,
//!   persisted across restarts.
//! - [`mqtt`] - the broker, wire codec, client-id authentication, and the
//!   internal HelperBot/ProxyClient MQTT clients.
//! - [`xmpp`] - the XMPP-like stream server: stanza framing, session state
//!   machine, and in-band STARTTLS.
//! - [`router`] - bridges command requests into [`mqtt::HelperBot`].
//! - [`tls`] - shared TLS material for both listeners.
//! - [`config`] - runtime configuration loaded from the environment.
//! - [`event`] - the pub/sub event bus used for session and identity
//!   lifecycle notifications.
//! - [`server`] - the top-level [`server::Server`] tying all of the above
//!   together.
//!
//! # Quick Start
//!
//! ```no_run
//! use bumper::config::Settings;
//! use bumper::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> bumper::error::Result<()> {
//!     let settings = Settings::from_env()?;
//!     let server = Server::build(settings).await?;
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod maintenance;
pub mod mqtt;
pub mod router;
pub mod server;
pub mod tls;
pub mod xmpp;

pub use config::Settings;
pub use error::{Error, Result};
pub use event::{BumperEvent, EventBus, SessionId};
pub use identity::{Client, Device, IdentityStore, OAuth, Token, User};
pub use mqtt::{MqttBroker, MqttBrokerBuilder};
pub use router::CommandRouter;
pub use server::Server;
pub use xmpp::{XmppServer, XmppServerBuilder};
