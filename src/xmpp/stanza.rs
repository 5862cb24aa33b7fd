// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal, stream-oriented XML handling for the subset of stanzas this
//! server ever sees: stream open/close, STARTTLS, SASL PLAIN auth, bind,
//! session, ping, presence, and `com:ctl`/`com:sf` command envelopes.
//!
//! Stanzas are small and their children are forwarded close to verbatim, so
//! rather than building a full DOM we read just the root tag's name and
//! attributes with `quick_xml` and keep the inner body as a raw substring to
//! pass through on forwarding, the way the wire format in
//! `test_xmppserver.py` shows the original doing.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Result, XmppError};

/// A parsed stanza: its root tag, attributes in received order, and the raw
/// (unparsed) inner XML if the element wasn't self-closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub inner: Option<String>,
}

impl Stanza {
    /// Looks up an attribute by name.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Splits the next complete unit off the front of `buf`: a `<stream:stream
/// ...>` open tag, a bare `</stream:stream>` close, or a balanced stanza via
/// [`split_next_stanza`].
///
/// The stream's own open/close tags never pair up within a single read (the
/// stream stays open for the life of the connection), so they need their own
/// detection ahead of the generic depth-tracking splitter.
#[must_use]
pub fn split_next_unit(buf: &str) -> Option<(&str, &str)> {
    let trimmed_start = buf.len() - buf.trim_start().len();
    let body = &buf[trimmed_start..];

    if body.starts_with("<stream:stream") {
        return split_stream_open(body);
    }
    if let Some(rest) = body.strip_prefix("</stream:stream>") {
        let end = body.len() - rest.len();
        return Some((&body[..end], rest));
    }
    split_next_stanza(body)
}

/// Finds the end of a `<stream:stream ...>` opening tag, respecting quoted
/// attribute values (which may themselves contain `>`).
fn split_stream_open(body: &str) -> Option<(&str, &str)> {
    let bytes = body.as_bytes();
    let mut in_quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match in_quote {
            Some(q) if b == q => in_quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => in_quote = Some(b),
            None if b == b'>' => return Some(body.split_at(i + 1)),
            None => {}
        }
    }
    None
}

/// Splits the next complete top-level element off the front of `buf`,
/// returning `(stanza_xml, remainder)`. Returns `None` if `buf` holds no
/// complete element yet (the caller should read more bytes).
///
/// Tracks open/close tag depth so a stanza whose children share the same
/// tag name as itself is still split correctly.
#[must_use]
pub fn split_next_stanza(buf: &str) -> Option<(&str, &str)> {
    let trimmed_start = buf.len() - buf.trim_start().len();
    let body = &buf[trimmed_start..];
    if body.is_empty() {
        return None;
    }

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text = true;
    let mut depth = 0_i32;
    let mut started = false;
    let mut byte_buf = Vec::new();

    loop {
        match reader.read_event_into(&mut byte_buf) {
            Ok(Event::Start(_)) => {
                depth += 1;
                started = true;
            }
            Ok(Event::End(_)) => {
                depth -= 1;
                if started && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let (stanza, rest) = body.split_at(end);
                    return Some((stanza, rest));
                }
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let (stanza, rest) = body.split_at(end);
                    return Some((stanza, rest));
                }
            }
            Ok(Event::Eof) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
        byte_buf.clear();
    }
}

/// Parses a single top-level stanza (as returned by [`split_next_stanza`])
/// into its root tag, attributes, and raw inner body.
pub fn parse_stanza(xml: &str) -> Result<Stanza> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text = true;
    let mut byte_buf = Vec::new();

    loop {
        match reader.read_event_into(&mut byte_buf) {
            Ok(Event::Start(start)) => {
                let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let attrs = read_attrs(&start)?;
                let open_end = reader.buffer_position() as usize;
                let inner = extract_inner(xml, open_end, &tag);
                return Ok(Stanza { tag, attrs, inner });
            }
            Ok(Event::Empty(start)) => {
                let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let attrs = read_attrs(&start)?;
                return Ok(Stanza { tag, attrs, inner: None });
            }
            Ok(Event::Eof) => return Err(XmppError::Xml(quick_xml::Error::UnexpectedEof("stanza".to_string())).into()),
            Ok(_) => {}
            Err(e) => return Err(XmppError::Xml(e).into()),
        }
        byte_buf.clear();
    }
}

fn read_attrs(start: &quick_xml::events::BytesStart) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmppError::Xml(quick_xml::Error::InvalidAttr(e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(XmppError::Xml)?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}

/// Finds the raw inner body of an element whose opening tag ends at byte
/// offset `open_end`, by locating the matching `</tag>` from the end of
/// `xml`, accounting for nested same-named children.
fn extract_inner(xml: &str, open_end: usize, tag: &str) -> Option<String> {
    let closing = format!("</{tag}>");
    let rest = &xml[open_end..];
    let close_pos = rest.rfind(&closing)?;
    Some(rest[..close_pos].to_string())
}

/// Renders an opening `<tag attr="val" ...>` (not self-closing).
#[must_use]
pub fn render_open(tag: &str, attrs: &[(&str, &str)]) -> String {
    let mut out = format!("<{tag}");
    for (k, v) in attrs {
        out.push_str(&format!(" {k}=\"{}\"", escape_attr(v)));
    }
    out.push('>');
    out
}

/// Renders a self-closing `<tag attr="val" .../>`.
#[must_use]
pub fn render_empty(tag: &str, attrs: &[(&str, &str)]) -> String {
    let mut out = format!("<{tag}");
    for (k, v) in attrs {
        out.push_str(&format!(" {k}=\"{}\"", escape_attr(v)));
    }
    out.push_str(" />");
    out
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}
