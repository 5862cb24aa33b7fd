// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level aggregate wiring the identity store, MQTT broker, XMPP server,
//! command router, and maintenance sweep into one process.
//!
//! Grounded in `bumper/__init__.py`'s `start()`, which constructs the same
//! set of pieces and awaits shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::identity::IdentityStore;
use crate::mqtt::{MqttBroker, PasswordFile};
use crate::router::CommandRouter;
use crate::tls;
use crate::xmpp::XmppServer;

/// A fully wired Bumper server, ready to [`Server::run`].
pub struct Server {
    settings: Settings,
    identity: Arc<IdentityStore>,
    events: EventBus,
    mqtt: MqttBroker,
    xmpp: XmppServer,
}

impl Server {
    /// Opens the identity store and builds the (not-yet-started) MQTT and
    /// XMPP listeners from `settings`.
    pub async fn build(settings: Settings) -> Result<Self> {
        let events = EventBus::new();
        let identity = Arc::new(IdentityStore::open(settings.identity_db_path(), events.clone())?);
        let passwords = PasswordFile::load(&settings.password_file_path())?;

        let mqtt_addr: SocketAddr = format!("{}:{}", settings.listen, settings.mqtt_port)
            .parse()
            .map_err(|e| Error::Fatal(format!("invalid mqtt listen address: {e}")))?;
        let xmpp_addr: SocketAddr = format!("{}:{}", settings.listen, settings.xmpp_port)
            .parse()
            .map_err(|e| Error::Fatal(format!("invalid xmpp listen address: {e}")))?;

        let mut mqtt_builder = MqttBroker::builder()
            .listen_addr(mqtt_addr)
            .use_auth(settings.use_auth)
            .identity(Arc::clone(&identity))
            .events(events.clone())
            .passwords(passwords);
        if settings.proxy_mqtt {
            mqtt_builder = mqtt_builder.proxy_mqtt(settings.proxy_mqtt_host.clone(), 443);
        }
        let mqtt = mqtt_builder.build().await?;

        let xmpp = XmppServer::builder()
            .listen_addr(xmpp_addr)
            .identity(Arc::clone(&identity))
            .events(events.clone())
            .build()?;

        Ok(Self {
            settings,
            identity,
            events,
            mqtt,
            xmpp,
        })
    }

    /// The shared event bus, for subscribers wanting session/identity
    /// notifications (see [`crate::event::EventBus::subscribe`]).
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// A command router sharing the broker's HelperBot connection, for
    /// bridging command requests (e.g. a future HTTP gateway) into device
    /// sessions. Returns `None` until [`Self::run`] has started the broker.
    pub async fn command_router(&self) -> Option<CommandRouter> {
        self.mqtt
            .helper_bot()
            .await
            .map(|bot| CommandRouter::new(Arc::clone(&self.identity), bot))
    }

    /// Starts both listeners, spawns the maintenance sweep, and blocks until
    /// `ctrl_c`, shutting everything down gracefully on exit.
    pub async fn run(self) -> Result<()> {
        let acceptor = tls::load_acceptor(&self.settings)?;

        self.mqtt.start(acceptor.clone()).await?;
        self.xmpp.start(acceptor).await?;
        info!("bumper server started");

        let maintenance = crate::maintenance::spawn(Arc::clone(&self.identity));

        tokio::signal::ctrl_c().await.map_err(crate::error::MqttError::Io)?;
        info!("shutdown signal received");

        maintenance.abort();
        self.xmpp.shutdown().await;
        self.mqtt.shutdown().await;

        Ok(())
    }
}
