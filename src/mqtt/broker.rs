// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MQTT broker: a TLS-terminated accept loop authenticating devices and
//! apps by client-id shape, then bridging their pub/sub traffic.
//!
//! Grounded in `bumper/mqtt/server.py`'s `MQTTServer`/
//! `BumperMQTTServerPlugin`. Unlike the teacher's `MqttBroker` (an outbound
//! client), this type hosts the listener itself.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{MqttError, Result};
use crate::event::{BumperEvent, EventBus, SessionId};
use crate::identity::{Client, Device, IdentityStore};

use super::auth::{authenticate_app_client, classify_client_id, AuthDecision, ClientIdKind, PasswordFile};
use super::codec::{self, ConnAckCode, PacketType, RawPacket};
use super::helper_bot::HelperBot;
use super::proxy::ProxyClient;
use super::topic::{self, ClassifiedTopic, PROXY_HELPER_RESOURCE};

/// Lifecycle of the broker, matching the state machine named in the
/// external interface section: `NotStarted -> Starting -> Started ->
/// Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    NotStarted,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Configuration for [`MqttBroker`].
#[derive(Debug, Clone)]
pub struct MqttBrokerConfig {
    pub listen_addr: SocketAddr,
    pub use_auth: bool,
    pub allow_anonymous: bool,
    pub proxy_mqtt: bool,
    pub proxy_mqtt_host: String,
    pub proxy_mqtt_port: u16,
}

struct Session {
    outbound: mpsc::Sender<Bytes>,
}

struct MqttBrokerInner {
    config: MqttBrokerConfig,
    identity: Arc<IdentityStore>,
    events: EventBus,
    passwords: PasswordFile,
    helper_bot: RwLock<Option<Arc<HelperBot>>>,
    sessions: RwLock<HashMap<String, Session>>,
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    proxy_clients: RwLock<HashMap<String, Arc<ProxyClient>>>,
    state: RwLock<BrokerState>,
}

/// Builder for [`MqttBroker`], matching the teacher's chained-setter shape.
pub struct MqttBrokerBuilder {
    listen_addr: Option<SocketAddr>,
    use_auth: bool,
    allow_anonymous: bool,
    proxy_mqtt: bool,
    proxy_mqtt_host: String,
    proxy_mqtt_port: u16,
    identity: Option<Arc<IdentityStore>>,
    events: Option<EventBus>,
    passwords: PasswordFile,
}

impl Default for MqttBrokerBuilder {
    fn default() -> Self {
        Self {
            listen_addr: None,
            use_auth: false,
            allow_anonymous: false,
            proxy_mqtt: false,
            proxy_mqtt_host: "mq-ww.ecouser.net".to_string(),
            proxy_mqtt_port: 443,
            identity: None,
            events: None,
            passwords: PasswordFile::default(),
        }
    }
}

impl MqttBrokerBuilder {
    /// Creates a new builder with default (insecure, non-proxy) settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn use_auth(mut self, use_auth: bool) -> Self {
        self.use_auth = use_auth;
        self
    }

    #[must_use]
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    #[must_use]
    pub fn proxy_mqtt(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_mqtt = true;
        self.proxy_mqtt_host = host.into();
        self.proxy_mqtt_port = port;
        self
    }

    #[must_use]
    pub fn identity(mut self, identity: Arc<IdentityStore>) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn passwords(mut self, passwords: PasswordFile) -> Self {
        self.passwords = passwords;
        self
    }

    /// Finalizes the broker. HelperBot is not connected yet — it dials in
    /// once [`MqttBroker::start`] has the listener bound.
    pub async fn build(self) -> Result<MqttBroker> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| MqttError::Protocol("listen_addr is required".to_string()))?;
        let identity = self
            .identity
            .ok_or_else(|| MqttError::Protocol("identity store is required".to_string()))?;
        let events = self.events.unwrap_or_default();

        let config = MqttBrokerConfig {
            listen_addr,
            use_auth: self.use_auth,
            allow_anonymous: self.allow_anonymous,
            proxy_mqtt: self.proxy_mqtt,
            proxy_mqtt_host: self.proxy_mqtt_host,
            proxy_mqtt_port: self.proxy_mqtt_port,
        };

        Ok(MqttBroker {
            inner: Arc::new(MqttBrokerInner {
                config,
                identity,
                events,
                passwords: self.passwords,
                helper_bot: RwLock::new(None),
                sessions: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                proxy_clients: RwLock::new(HashMap::new()),
                state: RwLock::new(BrokerState::NotStarted),
            }),
        })
    }
}

/// TLS-terminated MQTT broker bridging devices and apps.
#[derive(Clone)]
pub struct MqttBroker {
    inner: Arc<MqttBrokerInner>,
}

impl std::fmt::Debug for MqttBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBroker")
            .field("listen_addr", &self.inner.config.listen_addr)
            .finish_non_exhaustive()
    }
}

impl MqttBroker {
    /// Returns a new builder.
    #[must_use]
    pub fn builder() -> MqttBrokerBuilder {
        MqttBrokerBuilder::new()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> BrokerState {
        *self.inner.state.read().await
    }

    /// Binds the TLS listener, connects HelperBot to it, then starts
    /// accepting connections. On startup, resets every device and client's
    /// connection flags, matching the original's
    /// `bot_reset_connectionStatus`/`client_reset_connectionStatus`.
    #[instrument(skip(self, acceptor))]
    pub async fn start(&self, acceptor: TlsAcceptor) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            *state = BrokerState::Starting;
        }

        self.inner.identity.bot_reset_connection_status()?;
        self.inner.identity.client_reset_connection_status()?;

        let listener = TcpListener::bind(self.inner.config.listen_addr)
            .await
            .map_err(MqttError::Io)?;
        info!(addr = %self.inner.config.listen_addr, "mqtt broker listening");

        let helper_bot = Arc::new(
            HelperBot::connect(
                &self.inner.config.listen_addr.ip().to_string(),
                self.inner.config.listen_addr.port(),
                Duration::from_secs(60),
            )
            .await?,
        );
        *self.inner.helper_bot.write().await = Some(helper_bot);

        {
            let mut state = self.inner.state.write().await;
            *state = BrokerState::Started;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                if *inner.state.read().await == BrokerState::Stopping {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let inner = Arc::clone(&inner);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = accept_connection(inner, acceptor, stream, addr).await {
                                warn!(%addr, error = %e, "connection handling failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok(())
    }

    /// Stops every active session, then marks the broker stopped. Draining
    /// happens before HelperBot disconnects, matching the original's
    /// `MQTTServer.shutdown()` stopping each handler before the broker.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.write().await;
            *state = BrokerState::Stopping;
        }

        let sessions = self.inner.sessions.write().await;
        for session in sessions.values() {
            let _ = session.outbound.send(Bytes::new()).await;
        }
        drop(sessions);

        if let Some(helper_bot) = self.inner.helper_bot.write().await.take() {
            let _ = helper_bot.disconnect().await;
        }

        let mut state = self.inner.state.write().await;
        *state = BrokerState::Stopped;
    }

    /// Number of currently connected sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// The HelperBot connection backing this broker's command bridge, once
    /// [`Self::start`] has bound the listener. Shared with
    /// [`crate::router::CommandRouter`] rather than opening a second
    /// connection under the same client id.
    pub async fn helper_bot(&self) -> Option<Arc<HelperBot>> {
        self.inner.helper_bot.read().await.clone()
    }
}

async fn accept_connection(
    inner: Arc<MqttBrokerInner>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let tls_stream = acceptor.accept(stream).await.map_err(MqttError::Io)?;
    handle_session(inner, tls_stream, addr).await
}

async fn handle_session(inner: Arc<MqttBrokerInner>, stream: TlsStream<TcpStream>, addr: SocketAddr) -> Result<()> {
    let (mut read_half, write_half) = split(stream);

    let Some(connect_packet) = codec::read_packet(&mut read_half).await? else {
        return Ok(());
    };
    if connect_packet.packet_type != PacketType::Connect {
        return Err(MqttError::Protocol("expected CONNECT as first packet".to_string()).into());
    }
    let connect = codec::decode_connect(connect_packet.payload)?;

    // An unrecognized shape isn't rejected outright — it falls through to
    // the password-file/anonymous chain in `authorize`, matching the
    // original's file-auth check running regardless of the `"@" in
    // client_id` dispatch above it.
    let kind = classify_client_id(&connect.client_id).unwrap_or_else(|_| ClientIdKind::Unrecognized {
        username: connect.username.clone().unwrap_or_default(),
    });

    if !authorize(&inner, &kind, &connect.password).await? {
        warn!(client_id = %connect.client_id, "rejecting failed authentication");
        return reject(write_half, ConnAckCode::BadCredentials).await;
    }

    let session_id = SessionId::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(128);
    register_session(&inner, &connect.client_id, outbound_tx).await;
    mark_connected(&inner, &kind, true)?;
    inner
        .events
        .publish(BumperEvent::session_connected(session_id, connect.client_id.clone()));

    if inner.config.proxy_mqtt {
        if let ClientIdKind::Bot { .. } = &kind {
            let username = connect.username.clone().unwrap_or_default();
            let password = connect.password.clone().unwrap_or_default();
            maybe_start_proxy(&inner, &connect.client_id, &username, &password).await;
        }
    }

    let mut write_half = write_half;
    let connack = codec::encode_connack(ConnAckCode::Accepted);
    write_half.write_all(&connack).await.map_err(MqttError::Io)?;
    let write_task = spawn_writer(write_half, outbound_rx);

    let client_id = connect.client_id.clone();
    let result = read_loop(&inner, &mut read_half, &client_id).await;

    unregister_session(&inner, &client_id).await;
    if inner.config.proxy_mqtt {
        if let Some(proxy) = inner.proxy_clients.write().await.remove(&client_id) {
            let _ = proxy.disconnect().await;
        }
    }
    mark_connected(&inner, &kind, false).ok();
    inner.events.publish(BumperEvent::session_disconnected(session_id));
    write_task.abort();

    debug!(%client_id, %addr, "session closed");
    result
}

async fn reject(write_half: WriteHalf<TlsStream<TcpStream>>, code: ConnAckCode) -> Result<()> {
    let mut write_half = write_half;
    let connack = codec::encode_connack(code);
    write_half.write_all(&connack).await.map_err(MqttError::Io)?;
    Ok(())
}

async fn authorize(inner: &MqttBrokerInner, kind: &ClientIdKind, password: &Option<String>) -> Result<bool> {
    match kind {
        ClientIdKind::HelperBot => Ok(true),
        ClientIdKind::Bot { did, class, resource } => {
            inner
                .identity
                .bot_full_upsert(&Device::new(did.clone(), class.clone(), resource.clone()))?;
            Ok(true)
        }
        ClientIdKind::AppClient { userid, realm, resource } => {
            inner.identity.client_full_upsert(&Client {
                userid: userid.clone(),
                realm: realm.clone(),
                resource: resource.clone(),
                mqtt_connection: false,
                xmpp_connection: false,
            })?;
            let password = password.clone().unwrap_or_default();
            let decision = authenticate_app_client(
                &inner.identity,
                &inner.passwords,
                userid,
                &password,
                inner.config.use_auth,
                inner.config.allow_anonymous,
            )?;
            Ok(decision == AuthDecision::Accept)
        }
        ClientIdKind::Unrecognized { username } => {
            let password = password.clone().unwrap_or_default();
            if inner.passwords.verify(username, &password) {
                return Ok(true);
            }
            Ok(inner.config.allow_anonymous)
        }
    }
}

fn mark_connected(inner: &MqttBrokerInner, kind: &ClientIdKind, connected: bool) -> Result<()> {
    match kind {
        ClientIdKind::HelperBot | ClientIdKind::Unrecognized { .. } => Ok(()),
        ClientIdKind::Bot { did, .. } => inner.identity.bot_set_mqtt(did, connected),
        ClientIdKind::AppClient { userid, resource, .. } => inner.identity.client_set_mqtt(userid, resource, connected),
    }
}

async fn register_session(inner: &MqttBrokerInner, client_id: &str, outbound: mpsc::Sender<Bytes>) {
    let mut sessions = inner.sessions.write().await;
    sessions.insert(client_id.to_string(), Session { outbound });
}

async fn unregister_session(inner: &MqttBrokerInner, client_id: &str) {
    inner.sessions.write().await.remove(client_id);
    let mut subs = inner.subscriptions.write().await;
    for subscribers in subs.values_mut() {
        subscribers.remove(client_id);
    }
}

/// Starts a [`ProxyClient`] for a newly-connected bot, keyed by its full
/// `client_id` — matching the original's `self._proxy_clients[client_id]`,
/// which both looks the proxy up by the connecting client id and reuses
/// that same id (plus its own CONNECT credentials) to dial the vendor
/// broker as `ProxyClient(client_id, mqtt_server, ...)` /
/// `proxy.connect(username, password)`.
async fn maybe_start_proxy(inner: &Arc<MqttBrokerInner>, client_id: &str, username: &str, password: &str) {
    let mut proxies = inner.proxy_clients.write().await;
    if proxies.contains_key(client_id) {
        return;
    }
    let Some(helper_bot) = inner.helper_bot.read().await.clone() else {
        warn!(%client_id, "helperbot not connected yet, skipping proxy start");
        return;
    };
    match ProxyClient::connect(
        client_id,
        &inner.config.proxy_mqtt_host,
        inner.config.proxy_mqtt_port,
        username,
        password,
        helper_bot,
    )
    .await
    {
        Ok(client) => {
            proxies.insert(client_id.to_string(), Arc::new(client));
        }
        Err(e) => {
            warn!(%client_id, error = %e, "failed to start proxy client for device");
        }
    }
}

fn spawn_writer(
    mut write_half: WriteHalf<TlsStream<TcpStream>>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if bytes.is_empty() {
                break;
            }
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    })
}

async fn read_loop(inner: &Arc<MqttBrokerInner>, read_half: &mut ReadHalf<TlsStream<TcpStream>>, client_id: &str) -> Result<()> {
    loop {
        let Some(packet) = codec::read_packet(read_half).await? else {
            break;
        };
        match packet.packet_type {
            PacketType::Publish => handle_publish(inner, client_id, packet).await?,
            PacketType::Subscribe => handle_subscribe(inner, client_id, packet).await?,
            PacketType::Unsubscribe => handle_unsubscribe(inner, client_id, packet).await?,
            PacketType::PingReq => handle_pingreq(inner, client_id).await?,
            PacketType::Disconnect => break,
            other => {
                debug!(?other, %client_id, "ignoring packet type");
            }
        }
    }
    Ok(())
}

async fn handle_publish(inner: &Arc<MqttBrokerInner>, client_id: &str, packet: RawPacket) -> Result<()> {
    let publish = codec::decode_publish(packet.flags, packet.payload)?;
    log_message(&publish.topic, client_id);
    route_message(inner, &publish.topic, &publish.payload).await;

    if inner.config.proxy_mqtt {
        forward_to_proxy(inner, client_id, &publish.topic, &publish.payload).await;
    }
    Ok(())
}

/// Forwards a locally-published message upstream through the publisher's
/// own [`ProxyClient`], matching `on_broker_message_received`'s proxy
/// block. The proxy is looked up by the *publishing* client id — the
/// device's own proxy instance, not whatever device the topic happens to
/// name — since that instance is also the one holding the request-mapper
/// entry a `proxyhelper`-addressed reply needs popped.
async fn forward_to_proxy(inner: &Arc<MqttBrokerInner>, client_id: &str, topic: &str, payload: &[u8]) {
    let Some(proxy) = inner.proxy_clients.read().await.get(client_id).cloned() else {
        return;
    };

    let parts: Vec<&str> = topic.split('/').collect();
    let is_p2p = parts.len() == 12 && parts[1] == "p2p";

    if is_p2p && parts[3] == PROXY_HELPER_RESOURCE {
        // Traffic that arrived locally with its sender already rewritten to
        // proxyhelper originated from the vendor side; don't loop it back.
        return;
    }

    let rewritten_topic = if is_p2p && parts[6] == PROXY_HELPER_RESOURCE {
        match proxy.take_original_sender(parts[10]) {
            Some(original_sender) => {
                let mut owned: Vec<String> = parts.iter().map(|s| (*s).to_string()).collect();
                owned[6] = original_sender;
                owned.join("/")
            }
            None => {
                warn!(
                    %client_id,
                    request_id = parts[10],
                    "proxy request mapper missing entry, probably request took too long"
                );
                return;
            }
        }
    } else {
        topic.to_string()
    };

    if let Err(e) = proxy.publish(&rewritten_topic, payload.to_vec()).await {
        error!(error = %e, "failed to forward proxied message to vendor");
    }
}

/// Logs a received message using the same disambiguation the original uses
/// in `on_broker_message_received`: response-to-HelperBot, command-from-
/// HelperBot, broadcast, else generic.
fn log_message(topic: &str, client_id: &str) {
    match topic::classify(topic) {
        Ok(ClassifiedTopic::HelperBotResponse(_)) => debug!(%topic, %client_id, "received response"),
        Ok(ClassifiedTopic::HelperBotCommand(_)) => debug!(%topic, %client_id, "send command"),
        Ok(ClassifiedTopic::Broadcast(_)) => debug!(%topic, %client_id, "received broadcast"),
        Ok(ClassifiedTopic::PeerToPeer(_)) | Err(_) => debug!(%topic, %client_id, "received message"),
    }
}

async fn route_message(inner: &Arc<MqttBrokerInner>, topic: &str, payload: &[u8]) {
    let subs = inner.subscriptions.read().await;
    let sessions = inner.sessions.read().await;
    for (filter, subscribers) in subs.iter() {
        if !topic::topic_matches_filter(filter, topic) {
            continue;
        }
        for subscriber_id in subscribers {
            if let Some(session) = sessions.get(subscriber_id) {
                let frame = codec::encode_publish(topic, 0, None, payload).freeze();
                let _ = session.outbound.send(frame).await;
            }
        }
    }
}

async fn handle_subscribe(inner: &Arc<MqttBrokerInner>, client_id: &str, packet: RawPacket) -> Result<()> {
    let subscribe = codec::decode_subscribe(packet.payload)?;
    let mut subs = inner.subscriptions.write().await;
    let mut granted = Vec::with_capacity(subscribe.filters.len());
    for (filter, qos) in &subscribe.filters {
        subs.entry(filter.clone()).or_default().insert(client_id.to_string());
        granted.push(*qos);
    }
    drop(subs);

    if let Some(session) = inner.sessions.read().await.get(client_id) {
        let frame = codec::encode_suback(subscribe.packet_id, &granted).freeze();
        let _ = session.outbound.send(frame).await;
    }
    Ok(())
}

async fn handle_unsubscribe(inner: &Arc<MqttBrokerInner>, client_id: &str, packet: RawPacket) -> Result<()> {
    let unsubscribe = codec::decode_unsubscribe(packet.payload)?;
    let mut subs = inner.subscriptions.write().await;
    for filter in &unsubscribe.filters {
        if let Some(subscribers) = subs.get_mut(filter) {
            subscribers.remove(client_id);
        }
    }
    drop(subs);

    if let Some(session) = inner.sessions.read().await.get(client_id) {
        let frame = codec::encode_unsuback(unsubscribe.packet_id).freeze();
        let _ = session.outbound.send(frame).await;
    }
    Ok(())
}

async fn handle_pingreq(inner: &Arc<MqttBrokerInner>, client_id: &str) -> Result<()> {
    if let Some(session) = inner.sessions.read().await.get(client_id) {
        let frame = codec::encode_pingresp().freeze();
        let _ = session.outbound.send(frame).await;
    }
    Ok(())
}
