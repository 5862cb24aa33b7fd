// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-connection XMPP-like session state machine: `Connect -> Init -> Bind
//! -> Ready`, plus SASL PLAIN auth and STARTTLS negotiation.
//!
//! Grounded in `XMPPAsyncClient._parse_data` from `test_xmppserver.py`: the
//! wire strings this module produces are transcribed from that test's
//! assertions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;

use crate::error::{Result, XmppError};
use crate::event::SessionId;

use super::stanza::{parse_stanza, render_empty, render_open, Stanza};

/// Connection lifecycle, named identically to the original's class
/// constants (`CONNECT`, `INIT`, `BIND`, `READY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connect,
    Init,
    Bind,
    Ready,
    Closed,
}

/// Whether a session is a consumer app (`Controller`) or a robot (`Bot`),
/// determined from the `to` domain on stream open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Unknown,
    Controller,
    Bot,
}

#[derive(Debug, Default)]
struct SessionInner {
    state_started: bool,
    uid: Option<String>,
    resource: Option<String>,
    devclass: Option<String>,
    bumper_jid: Option<String>,
    tls_upgraded: bool,
}

/// A live XMPP-like connection.
pub struct XmppSession {
    pub id: SessionId,
    pub peer_addr: std::net::SocketAddr,
    state: Mutex<SessionState>,
    kind: Mutex<ClientKind>,
    inner: Mutex<SessionInner>,
}

/// Outcome of feeding one stanza to a session: stanzas to send back to this
/// client, and stanzas to forward elsewhere (jid, stanza).
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub to_self: Vec<String>,
    pub forward: Vec<(String, String)>,
    pub broadcast: Vec<String>,
    pub close: bool,
    /// Set once `<proceed/>` has been queued in `to_self`; the caller must
    /// perform the actual TLS handshake on the underlying socket next.
    pub upgrade_tls: bool,
}

impl XmppSession {
    /// Creates a new session in the `Connect` state.
    #[must_use]
    pub fn new(peer_addr: std::net::SocketAddr) -> Self {
        Self {
            id: SessionId::new(),
            peer_addr,
            state: Mutex::new(SessionState::Connect),
            kind: Mutex::new(ClientKind::Unknown),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn kind(&self) -> ClientKind {
        *self.kind.lock()
    }

    #[must_use]
    pub fn bumper_jid(&self) -> Option<String> {
        self.inner.lock().bumper_jid.clone()
    }

    /// The authenticated user/device id (`authcid` from SASL), once known.
    #[must_use]
    pub fn uid(&self) -> Option<String> {
        self.inner.lock().uid.clone()
    }

    /// Processes one complete top-level stanza, returning what to send back
    /// to this client and what to forward elsewhere.
    pub fn handle_stanza(&self, xml: &str) -> Result<SessionOutput> {
        let trimmed = xml.trim();
        if trimmed == "</stream:stream>" {
            *self.state.lock() = SessionState::Closed;
            return Ok(SessionOutput {
                to_self: vec!["</stream:stream>".to_string()],
                close: true,
                ..Default::default()
            });
        }

        // `<stream:stream ...>` never self-closes in practice but also never
        // carries a matching `</stream:stream>` in the same read, so it's
        // handled before generic stanza parsing.
        if trimmed.starts_with("<stream:stream") {
            return Ok(SessionOutput {
                to_self: self.handle_stream_open(trimmed)?,
                ..Default::default()
            });
        }

        let stanza = parse_stanza(trimmed)?;
        match stanza.tag.as_str() {
            "starttls" => Ok(SessionOutput {
                to_self: vec![render_empty("proceed", &[("xmlns", "urn:ietf:params:xml:ns:xmpp-tls")])],
                upgrade_tls: true,
                ..Default::default()
            }),
            "auth" => Ok(SessionOutput {
                to_self: self.handle_auth(&stanza)?,
                ..Default::default()
            }),
            "iq" => self.handle_iq(&stanza),
            "presence" => Ok(SessionOutput {
                to_self: self.handle_presence(&stanza),
                ..Default::default()
            }),
            _ => Ok(SessionOutput::default()),
        }
    }

    fn handle_stream_open(&self, xml: &str) -> Result<Vec<String>> {
        let stanza = parse_stanza(&format!("{xml}</stream:stream>"))?;
        let to = stanza.attr("to").unwrap_or("ecouser.net").to_string();

        {
            let mut kind = self.kind.lock();
            if *kind == ClientKind::Unknown {
                *kind = if to.ends_with(".ecorobot.net") {
                    ClientKind::Bot
                } else {
                    ClientKind::Controller
                };
            }
        }

        let open = render_open(
            "stream:stream",
            &[
                ("xmlns:stream", "http://etherx.jabber.org/streams"),
                ("xmlns", "jabber:client"),
                ("version", "1.0"),
                ("id", "1"),
                ("from", "ecouser.net"),
            ],
        );

        let state = self.state();
        let features = if state == SessionState::Connect {
            let tls_upgraded = self.inner.lock().tls_upgraded;
            if tls_upgraded {
                "<stream:features><mechanisms xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"><mechanism>PLAIN</mechanism></mechanisms></stream:features>".to_string()
            } else {
                "<stream:features><starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"><required/></starttls><mechanisms xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"><mechanism>PLAIN</mechanism></mechanisms></stream:features>".to_string()
            }
        } else {
            "<stream:features><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/><session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/></stream:features>".to_string()
        };

        Ok(vec![open, features])
    }

    /// Marks this session as having completed a STARTTLS upgrade; the next
    /// stream open will omit the STARTTLS feature advertisement.
    pub fn mark_tls_upgraded(&self) {
        self.inner.lock().tls_upgraded = true;
    }

    fn handle_auth(&self, stanza: &Stanza) -> Result<Vec<String>> {
        let payload = stanza.inner.clone().unwrap_or_default();
        let decoded = BASE64
            .decode(payload.trim())
            .map_err(|_| XmppError::AuthFailed("malformed base64 SASL payload".to_string()))?;
        let text = String::from_utf8_lossy(&decoded);
        let mut fields = text.split('\0');
        let _authzid = fields.next();
        let authcid = fields
            .next()
            .ok_or_else(|| XmppError::AuthFailed("missing authcid".to_string()))?;

        {
            let mut inner = self.inner.lock();
            inner.uid = Some(authcid.to_string());
        }
        *self.state.lock() = SessionState::Init;
        if *self.kind.lock() == ClientKind::Unknown {
            *self.kind.lock() = ClientKind::Bot;
        }

        Ok(vec!["<success xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"/>".to_string()])
    }

    fn handle_iq(&self, stanza: &Stanza) -> Result<SessionOutput> {
        if let Some(bind_inner) = stanza.inner.as_deref().filter(|b| b.contains("xmpp-bind")) {
            return Ok(SessionOutput {
                to_self: vec![self.handle_bind(stanza, bind_inner)?],
                ..Default::default()
            });
        }
        if stanza
            .inner
            .as_deref()
            .is_some_and(|b| b.contains("xmpp-session"))
        {
            *self.state.lock() = SessionState::Ready;
            let id = stanza.attr("id").unwrap_or_default();
            return Ok(SessionOutput {
                to_self: vec![format!(r#"<iq type="result" id="{id}" />"#)],
                ..Default::default()
            });
        }
        if stanza
            .inner
            .as_deref()
            .is_some_and(|b| b.contains("jabber:iq:roster"))
        {
            let id = stanza.attr("id").unwrap_or_default();
            return Ok(SessionOutput {
                to_self: vec![format!(
                    r#"<iq type="error" id="{id}"><error type="cancel" code="501"><feature-not-implemented xmlns="urn:ietf:params:xml:ns:xmpp-stanzas"/></error></iq>"#
                )],
                ..Default::default()
            });
        }
        if stanza
            .inner
            .as_deref()
            .is_some_and(|b| b.contains("urn:xmpp:ping"))
        {
            return self.handle_ping(stanza);
        }
        self.handle_routed_iq(stanza)
    }

    fn handle_bind(&self, stanza: &Stanza, bind_inner: &str) -> Result<String> {
        let resource = extract_tag_text(bind_inner, "resource").unwrap_or_default();
        let uid = self.inner.lock().uid.clone().unwrap_or_default();

        let jid = match self.kind() {
            ClientKind::Bot => {
                let devclass = self.inner.lock().devclass.clone().unwrap_or_default();
                format!("{uid}@{devclass}.ecorobot.net/{resource}")
            }
            _ => format!("{uid}@ecouser.net/{resource}"),
        };

        self.inner.lock().resource = Some(resource);
        self.inner.lock().bumper_jid = Some(jid.clone());
        *self.state.lock() = SessionState::Bind;

        let id = stanza.attr("id").unwrap_or_default();
        Ok(format!(
            r#"<iq type="result" id="{id}"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"><jid>{jid}</jid></bind></iq>"#
        ))
    }

    /// Sets the device class a bot session binds under. Bots authenticate
    /// with only their `did`; the class comes from the MQTT/identity layer
    /// looking up the bot record, so the server wires it in before bind.
    pub fn set_devclass(&self, devclass: impl Into<String>) {
        self.inner.lock().devclass = Some(devclass.into());
    }

    fn handle_presence(&self, _stanza: &Stanza) -> Vec<String> {
        let jid = self.bumper_jid().unwrap_or_default();
        vec![format!(r#"<presence to="{jid}"> dummy </presence>"#)]
    }

    fn handle_ping(&self, stanza: &Stanza) -> Result<SessionOutput> {
        let id = stanza.attr("id").unwrap_or_default();
        let to = stanza.attr("to");

        if to.is_none() || to == Some("ecouser.net") || to.is_some_and(|t| t.ends_with(".ecorobot.net")) {
            return Ok(SessionOutput {
                to_self: vec![format!(r#"<iq type="result" id="{id}" from="{}"/>"#, to.unwrap_or("159.ecorobot.net"))],
                ..Default::default()
            });
        }

        let from_jid = self.bumper_jid().unwrap_or_default();
        let rendered = insert_attr(&stanza_to_xml(stanza), "from", &from_jid);
        Ok(SessionOutput {
            forward: vec![(to.unwrap().to_string(), rendered)],
            ..Default::default()
        })
    }

    fn handle_routed_iq(&self, stanza: &Stanza) -> Result<SessionOutput> {
        let from_jid = self.bumper_jid().unwrap_or_default();
        let to = stanza.attr("to").map(str::to_string);

        let body = with_query_xmlns_default(stanza);
        let rendered = insert_attr(&body, "from", &from_jid);

        match to {
            Some(target) if target == "rl.ecorobot.net" => Ok(SessionOutput {
                broadcast: vec![rendered],
                ..Default::default()
            }),
            Some(target) => Ok(SessionOutput {
                forward: vec![(target, rendered)],
                ..Default::default()
            }),
            None => Ok(SessionOutput::default()),
        }
    }
}

/// Extracts the text content of a single-level `<tag>...</tag>` inside
/// `xml`, used for pulling `<resource>` out of a `<bind>` body.
fn extract_tag_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

fn stanza_to_xml(stanza: &Stanza) -> String {
    let attrs: Vec<(&str, &str)> = stanza.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    match &stanza.inner {
        Some(inner) => format!("{}{inner}</{}>", render_open(&stanza.tag, &attrs), stanza.tag),
        None => render_empty(&stanza.tag, &attrs),
    }
}

/// Ensures the stanza's lone `<query>` child carries an `xmlns`, defaulting
/// to `com:ctl` when absent — matching the forwarding behavior observed for
/// bot-originated command envelopes.
fn with_query_xmlns_default(stanza: &Stanza) -> String {
    let Some(inner) = &stanza.inner else {
        return stanza_to_xml(stanza);
    };
    if inner.trim_start().starts_with("<query xmlns=") || !inner.trim_start().starts_with("<query") {
        return stanza_to_xml(stanza);
    }
    let patched_inner = inner.replacen("<query", "<query xmlns=\"com:ctl\"", 1);
    let attrs: Vec<(&str, &str)> = stanza.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    format!("{}{patched_inner}</{}>", render_open(&stanza.tag, &attrs), stanza.tag)
}

/// Appends `name="value"` just before the closing `>` of the opening tag.
fn insert_attr(xml: &str, name: &str, value: &str) -> String {
    let Some(tag_end) = xml.find('>') else {
        return xml.to_string();
    };
    let self_closing = xml[..tag_end].ends_with('/');
    let insert_at = if self_closing { tag_end - 1 } else { tag_end };
    let mut out = String::with_capacity(xml.len() + name.len() + value.len() + 4);
    out.push_str(&xml[..insert_at]);
    out.push_str(&format!(r#" {name}="{value}""#));
    out.push_str(&xml[insert_at..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> XmppSession {
        XmppSession::new("127.0.0.1:5223".parse().unwrap())
    }

    #[test]
    fn stream_open_without_tls_advertises_starttls() {
        let session = session();
        let out = session
            .handle_stanza("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0' to='ecouser.net'>")
            .unwrap();
        assert_eq!(out.to_self.len(), 2);
        assert!(out.to_self[1].contains("starttls"));
    }

    #[test]
    fn stream_open_after_tls_omits_starttls() {
        let session = session();
        session.mark_tls_upgraded();
        let out = session
            .handle_stanza("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0' to='ecouser.net'>")
            .unwrap();
        assert!(!out.to_self[1].contains("starttls"));
    }

    #[test]
    fn auth_success_transitions_to_init() {
        let session = session();
        let stanza = parse_stanza(
            r#"<auth xmlns="urn:ietf:params:xml:ns:xmpp-sasl" mechanism="PLAIN">AGZ1aWRfdG1wdXNlcgAwL0lPU0Y1M0QwN0JBL3VzXzg5ODgwMmZkYmM0NDQxYjBiYzgxNWIxZDFjNjgzMDJl</auth>"#,
        )
        .unwrap();
        let out = session.handle_auth(&stanza).unwrap();
        assert_eq!(out[0], r#"<success xmlns="urn:ietf:params:xml:ns:xmpp-sasl"/>"#);
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test]
    fn bind_produces_controller_jid() {
        let session = session();
        session.inner.lock().uid = Some("fuid_tmpuser".to_string());
        *session.kind.lock() = ClientKind::Controller;
        *session.state.lock() = SessionState::Init;

        let stanza = parse_stanza(
            r#"<iq type="set" id="5E9872D5"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"><resource>IOSF53D07BA</resource></bind></iq>"#,
        )
        .unwrap();
        let out = session.handle_iq(&stanza).unwrap();
        assert_eq!(
            out.to_self[0],
            r#"<iq type="result" id="5E9872D5"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"><jid>fuid_tmpuser@ecouser.net/IOSF53D07BA</jid></bind></iq>"#
        );
        assert_eq!(session.state(), SessionState::Bind);
    }

    #[test]
    fn session_request_moves_to_ready() {
        let session = session();
        let stanza = parse_stanza(r#"<iq type="set" id="FA1"><session xmlns="urn:ietf:params:xml:ns:xmpp-session"/></iq>"#).unwrap();
        let out = session.handle_iq(&stanza).unwrap();
        assert_eq!(out.to_self[0], r#"<iq type="result" id="FA1" />"#);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn presence_replies_with_dummy() {
        let session = session();
        session.inner.lock().bumper_jid = Some("fuid_tmpuser@ecouser.net/IOSF53D07BA".to_string());
        let stanza = parse_stanza(r#"<presence type="available"/>"#).unwrap();
        let out = session.handle_presence(&stanza);
        assert_eq!(out[0], r#"<presence to="fuid_tmpuser@ecouser.net/IOSF53D07BA"> dummy </presence>"#);
    }

    #[test]
    fn roster_query_is_not_implemented() {
        let session = session();
        let stanza = parse_stanza(r#"<iq id="EE0XQ-2" type="get"><query xmlns="jabber:iq:roster"></query></iq>"#).unwrap();
        let out = session.handle_iq(&stanza).unwrap();
        assert_eq!(
            out.to_self[0],
            r#"<iq type="error" id="EE0XQ-2"><error type="cancel" code="501"><feature-not-implemented xmlns="urn:ietf:params:xml:ns:xmpp-stanzas"/></error></iq>"#
        );
    }

    #[test]
    fn command_iq_is_forwarded_with_from() {
        let session = session();
        session.inner.lock().bumper_jid = Some("fuid_tmpuser@ecouser.net/IOSF53D07BA".to_string());
        let stanza = parse_stanza(
            r#"<iq id="7" to="E0000000000000001234@159.ecorobot.net/atom" type="set"><query xmlns="com:ctl"><ctl id="72107787" td="GetCleanState" /></query></iq>"#,
        )
        .unwrap();
        let out = session.handle_iq(&stanza).unwrap();
        assert_eq!(out.forward.len(), 1);
        assert_eq!(out.forward[0].0, "E0000000000000001234@159.ecorobot.net/atom");
        assert!(out.forward[0].1.ends_with(r#"from="fuid_tmpuser@ecouser.net/IOSF53D07BA""#));
    }

    #[test]
    fn command_iq_without_query_xmlns_defaults_to_com_ctl() {
        let session = session();
        session.inner.lock().bumper_jid = Some("E0000000000000001234@159.ecorobot.net/atom".to_string());
        let stanza = parse_stanza(
            r#"<iq xmlns:ns0="com:ctl" id="2679" to="fuid_tmpuser@ecouser.net/IOSF53D07BA" type="set"><query><ctl td="ChargeState"><charge h="0" r="a" type="Going" /></ctl></query></iq>"#,
        )
        .unwrap();
        let out = session.handle_iq(&stanza).unwrap();
        assert!(out.forward[0].1.contains(r#"<query xmlns="com:ctl">"#));
    }

    #[test]
    fn dorp_error_broadcasts() {
        let session = session();
        session.inner.lock().bumper_jid = Some("E0000000000000001234@159.ecorobot.net/atom".to_string());
        let stanza = parse_stanza(
            r#"<iq to="rl.ecorobot.net" type="set" id="1234"><query xmlns="com:sf"><sf td="pub"/></query></iq>"#,
        )
        .unwrap();
        let out = session.handle_iq(&stanza).unwrap();
        assert_eq!(out.broadcast.len(), 1);
    }
}
