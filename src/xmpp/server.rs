// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The XMPP-like server: a plain-TCP accept loop with in-band STARTTLS,
//! dispatching stanzas to per-connection [`XmppSession`]s and forwarding
//! `com:ctl`/`com:sf` envelopes between JID-registered sessions.
//!
//! Grounded in `bumper/xmpp/server.py`'s `XMPPServer`, mirroring the builder
//! and `Arc<Inner>` handle shape used by [`crate::mqtt::MqttBroker`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result, XmppError};
use crate::event::{BumperEvent, EventBus};
use crate::identity::IdentityStore;

use super::session::{ClientKind, SessionState, XmppSession};
use super::stanza::split_next_unit;

/// Lifecycle of the server, matching [`crate::mqtt::BrokerState`]'s shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmppServerState {
    NotStarted,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Configuration for [`XmppServer`].
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    pub listen_addr: SocketAddr,
}

struct XmppServerInner {
    config: XmppServerConfig,
    identity: Arc<IdentityStore>,
    events: EventBus,
    registry: RwLock<HashMap<String, mpsc::Sender<String>>>,
    state: RwLock<XmppServerState>,
}

/// Builder for [`XmppServer`].
pub struct XmppServerBuilder {
    listen_addr: Option<SocketAddr>,
    identity: Option<Arc<IdentityStore>>,
    events: Option<EventBus>,
}

impl Default for XmppServerBuilder {
    fn default() -> Self {
        Self {
            listen_addr: None,
            identity: None,
            events: None,
        }
    }
}

impl XmppServerBuilder {
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
    pub fn identity(mut self, identity: Arc<IdentityStore>) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<XmppServer> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| Error::Fatal("listen_addr is required".to_string()))?;
        let identity = self
            .identity
            .ok_or_else(|| Error::Fatal("identity store is required".to_string()))?;
        let events = self.events.unwrap_or_default();

        Ok(XmppServer {
            inner: Arc::new(XmppServerInner {
                config: XmppServerConfig { listen_addr },
                identity,
                events,
                registry: RwLock::new(HashMap::new()),
                state: RwLock::new(XmppServerState::NotStarted),
            }),
        })
    }
}

/// Plain-TCP listener with in-band STARTTLS, hosting XMPP-like sessions.
#[derive(Clone)]
pub struct XmppServer {
    inner: Arc<XmppServerInner>,
}

impl std::fmt::Debug for XmppServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppServer")
            .field("listen_addr", &self.inner.config.listen_addr)
            .finish_non_exhaustive()
    }
}

impl XmppServer {
    #[must_use]
    pub fn builder() -> XmppServerBuilder {
        XmppServerBuilder::new()
    }

    pub async fn state(&self) -> XmppServerState {
        *self.inner.state.read().await
    }

    /// Number of sessions currently registered under a bound JID.
    pub async fn session_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Binds the plain-TCP listener and starts accepting connections.
    /// `acceptor` is used only when a session negotiates STARTTLS.
    #[instrument(skip(self, acceptor))]
    pub async fn start(&self, acceptor: TlsAcceptor) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            *state = XmppServerState::Starting;
        }

        let listener = TcpListener::bind(self.inner.config.listen_addr)
            .await
            .map_err(XmppError::Io)?;
        info!(addr = %self.inner.config.listen_addr, "xmpp server listening");

        {
            let mut state = self.inner.state.write().await;
            *state = XmppServerState::Started;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                if *inner.state.read().await == XmppServerState::Stopping {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let inner = Arc::clone(&inner);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(inner, acceptor, stream, addr).await {
                                warn!(%addr, error = %e, "xmpp connection handling failed");
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

    /// Marks every registered session closed from the registry's
    /// perspective; live connections notice on their next write and exit.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.write().await;
            *state = XmppServerState::Stopping;
        }
        self.inner.registry.write().await.clear();
        let mut state = self.inner.state.write().await;
        *state = XmppServerState::Stopped;
    }
}

/// A TCP stream that may or may not have been upgraded to TLS via an
/// in-band STARTTLS negotiation. The read/write loop stays uniform across
/// the upgrade by going through this instead of a raw `TcpStream`.
enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn handle_connection(
    inner: Arc<XmppServerInner>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let mut conn = Conn::Plain(stream);
    let session = Arc::new(XmppSession::new(addr));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(32);

    let mut buf = String::new();
    let mut read_buf = [0_u8; 4096];

    loop {
        tokio::select! {
            biased;
            Some(msg) = outbound_rx.recv() => {
                conn.write_all(msg.as_bytes()).await.map_err(XmppError::Io)?;
            }
            n = conn.read(&mut read_buf) => {
                let n = n.map_err(XmppError::Io)?;
                if n == 0 {
                    break;
                }
                buf.push_str(&String::from_utf8_lossy(&read_buf[..n]));

                while let Some((unit, rest)) = split_next_unit(&buf) {
                    let unit = unit.to_string();
                    buf = rest.to_string();

                    let output = session.handle_stanza(&unit)?;
                    for msg in &output.to_self {
                        conn.write_all(msg.as_bytes()).await.map_err(XmppError::Io)?;
                    }

                    if output.upgrade_tls {
                        conn = upgrade_to_tls(conn, &acceptor).await?;
                        session.mark_tls_upgraded();
                    }

                    if session.state() == SessionState::Init {
                        ensure_devclass(&inner, &session).await;
                    }

                    if session.state() == SessionState::Bind && session.bumper_jid().is_some() {
                        register_session(&inner, &session, &outbound_tx).await;
                    }

                    for (jid, xml) in output.forward {
                        forward_to_jid(&inner, &jid, xml).await;
                    }
                    for xml in output.broadcast {
                        broadcast(&inner, session.bumper_jid().as_deref(), xml).await;
                    }

                    if output.close {
                        let _ = conn.shutdown().await;
                        unregister(&inner, &session).await;
                        debug!(addr = %addr, "xmpp session closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    unregister(&inner, &session).await;
    debug!(addr = %addr, "xmpp connection dropped");
    Ok(())
}

async fn upgrade_to_tls(conn: Conn, acceptor: &TlsAcceptor) -> Result<Conn> {
    match conn {
        Conn::Plain(tcp) => {
            let tls = acceptor.accept(tcp).await.map_err(XmppError::Io)?;
            Ok(Conn::Tls(Box::new(tls)))
        }
        already_tls @ Conn::Tls(_) => Ok(already_tls),
    }
}

async fn register_session(inner: &XmppServerInner, session: &Arc<XmppSession>, outbound: &mpsc::Sender<String>) {
    let Some(jid) = session.bumper_jid() else { return };
    inner.registry.write().await.insert(jid.clone(), outbound.clone());
    inner.events.publish(BumperEvent::session_connected(session.id, jid.clone()));
    match session.kind() {
        ClientKind::Bot => {
            if let Some(did) = jid.split('@').next() {
                let _ = inner.identity.bot_set_xmpp(did, true);
            }
        }
        _ => {
            if let (Some(userid), Some(resource)) = parse_client_jid(&jid) {
                let _ = inner.identity.client_set_xmpp(&userid, &resource, true);
            }
        }
    }
}

/// Bots authenticate with only their `did`; their vendor device class comes
/// from the bot record the MQTT broker already upserted, so the XMPP server
/// looks it up before a bot's `<bind>` is handled.
async fn ensure_devclass(inner: &XmppServerInner, session: &Arc<XmppSession>) {
    if session.kind() != ClientKind::Bot {
        return;
    }
    let Some(uid) = session.uid() else { return };
    if let Ok(Some(device)) = inner.identity.bot_get(&uid) {
        session.set_devclass(device.class);
    }
}

async fn unregister(inner: &XmppServerInner, session: &Arc<XmppSession>) {
    let Some(jid) = session.bumper_jid() else { return };
    inner.registry.write().await.remove(&jid);
    inner.events.publish(BumperEvent::session_disconnected(session.id));
    match session.kind() {
        ClientKind::Bot => {
            if let Some(did) = jid.split('@').next() {
                let _ = inner.identity.bot_set_xmpp(did, false);
            }
        }
        _ => {
            if let (Some(userid), Some(resource)) = parse_client_jid(&jid) {
                let _ = inner.identity.client_set_xmpp(&userid, &resource, false);
            }
        }
    }
}

fn parse_client_jid(jid: &str) -> (Option<String>, Option<String>) {
    let Some((userid, rest)) = jid.split_once('@') else {
        return (None, None);
    };
    let resource = rest.split_once('/').map(|(_, r)| r.to_string());
    (Some(userid.to_string()), resource)
}

async fn forward_to_jid(inner: &XmppServerInner, jid: &str, xml: String) {
    let registry = inner.registry.read().await;
    match registry.get(jid) {
        Some(sender) => {
            if sender.send(xml).await.is_err() {
                warn!(%jid, "forward target's outbound channel closed");
            }
        }
        None => warn!(%jid, error = %XmppError::NoSuchJid(jid.to_string()), "dropping forwarded stanza"),
    }
}

async fn broadcast(inner: &XmppServerInner, exclude_jid: Option<&str>, xml: String) {
    let registry = inner.registry.read().await;
    for (jid, sender) in registry.iter() {
        if Some(jid.as_str()) == exclude_jid {
            continue;
        }
        let _ = sender.send(xml.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_requires_listen_addr() {
        let identity = Arc::new(IdentityStore::open_in_memory(EventBus::new()).unwrap());
        let result = XmppServerBuilder::new().identity(identity).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn builder_requires_identity() {
        let result = XmppServerBuilder::new()
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn parse_client_jid_splits_userid_and_resource() {
        assert_eq!(
            parse_client_jid("fuid_tmpuser@ecouser.net/IOSF53D07BA"),
            (Some("fuid_tmpuser".to_string()), Some("IOSF53D07BA".to_string()))
        );
    }
}
