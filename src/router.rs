// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridges inbound command requests (from the HTTP gateway or a future
//! admin surface) to [`HelperBot::send_command`], shaping the reply the way
//! the vendor app expects.
//!
//! Grounded in `bumper/plugins/bumper_confserver_api_dim.py`'s
//! `_handle_dim_devmanager`: look up the target bot, refuse if it has no
//! live MQTT session, forward through HelperBot, and translate the outcome
//! into the `{id, ret, resp|errno}` envelope the app understands.

use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, RouterError};
use crate::identity::IdentityStore;
use crate::mqtt::{parse_json_response, CommandOutcome, DeviceCommand, HelperBot, PayloadType};

/// Generic failure code the vendor app expects for any non-`ok` reply.
pub const ERR_COMMON: &str = "0001";

/// The `GetCleanLogs` request payload, matching the original's literal
/// `'<ctl count="30"/>'`.
const GET_CLEAN_LOGS_PAYLOAD: &str = r#"<ctl count="30"/>"#;

/// One cleaning history entry, mapped from a `<clean>` element's `s`/`a`/
/// `l`/`t` attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanLogEntry {
    pub ts: String,
    pub area: String,
    pub last: String,
    #[serde(rename = "cleanType")]
    pub clean_type: String,
}

/// The `{id, ret, logs|errno}` envelope returned by [`CommandRouter::get_clean_logs`].
#[derive(Debug, Clone, Serialize)]
pub struct CleanLogsReply {
    pub id: String,
    pub ret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<CleanLogEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<String>,
}

/// The `{id, ret, resp|errno}` envelope returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReply {
    pub id: String,
    pub ret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<String>,
}

impl CommandReply {
    fn from_outcome(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Ok { request_id, response } => Self {
                id: request_id,
                ret: "ok".to_string(),
                resp: parse_json_response(&response),
                errno: None,
            },
            CommandOutcome::Timeout { request_id } | CommandOutcome::Failed { request_id, .. } => Self {
                id: request_id,
                ret: "fail".to_string(),
                resp: None,
                errno: Some(ERR_COMMON.to_string()),
            },
        }
    }
}

/// Bridges command requests into HelperBot, consulting the identity store
/// to confirm the target device is actually reachable first.
#[derive(Clone)]
pub struct CommandRouter {
    identity: Arc<IdentityStore>,
    helper_bot: Arc<HelperBot>,
}

impl CommandRouter {
    /// Builds a router over an already-connected HelperBot.
    #[must_use]
    pub fn new(identity: Arc<IdentityStore>, helper_bot: Arc<HelperBot>) -> Self {
        Self { identity, helper_bot }
    }

    /// Sends `cmd_name` to `did` with the given payload, returning the
    /// shaped reply once HelperBot's response arrives or times out.
    pub async fn send_command(
        &self,
        did: &str,
        cmd_name: impl Into<String>,
        payload_type: PayloadType,
        payload: impl Into<String>,
    ) -> Result<CommandReply> {
        let device = self
            .identity
            .bot_get(did)?
            .ok_or_else(|| RouterError::DeviceNotConnected(did.to_string()))?;
        if !device.mqtt_connection {
            return Err(RouterError::DeviceNotConnected(did.to_string()).into());
        }

        let request_id = random_request_id();
        let command = DeviceCommand {
            cmd_name: cmd_name.into(),
            to_id: did.to_string(),
            to_type: device.class,
            to_res: device.resource,
            payload_type,
            payload: payload.into(),
        };

        let outcome = self.helper_bot.send_command(&command, &request_id).await;
        Ok(CommandReply::from_outcome(outcome))
    }

    /// Fetches cleaning history for `did`, matching `_handle_lg_log`'s
    /// `GetCleanLogs` branch: sends the `<ctl count="30"/>` request and
    /// maps each `<clean>` element of the XML reply into a [`CleanLogEntry`].
    pub async fn get_clean_logs(&self, did: &str) -> Result<CleanLogsReply> {
        let device = self
            .identity
            .bot_get(did)?
            .ok_or_else(|| RouterError::DeviceNotConnected(did.to_string()))?;
        if !device.mqtt_connection {
            return Err(RouterError::DeviceNotConnected(did.to_string()).into());
        }

        let request_id = random_request_id();
        let command = DeviceCommand {
            cmd_name: "GetCleanLogs".to_string(),
            to_id: did.to_string(),
            to_type: device.class,
            to_res: device.resource,
            payload_type: PayloadType::Text,
            payload: GET_CLEAN_LOGS_PAYLOAD.to_string(),
        };

        let outcome = self.helper_bot.send_command(&command, &request_id).await;
        Ok(match outcome {
            CommandOutcome::Ok { request_id, response } => match parse_clean_logs(&response) {
                Some(logs) => CleanLogsReply {
                    id: request_id,
                    ret: "ok".to_string(),
                    logs: Some(logs),
                    errno: None,
                },
                None => CleanLogsReply {
                    id: request_id,
                    ret: "fail".to_string(),
                    logs: None,
                    errno: Some(ERR_COMMON.to_string()),
                },
            },
            CommandOutcome::Timeout { request_id } | CommandOutcome::Failed { request_id, .. } => CleanLogsReply {
                id: request_id,
                ret: "fail".to_string(),
                logs: None,
                errno: Some(ERR_COMMON.to_string()),
            },
        })
    }
}

/// Parses a `GetCleanLogs` XML reply (`<ctl ret="...">` wrapping zero or
/// more `<clean s="" a="" l="" t=""/>` children) into its log entries.
/// Returns `None` on malformed XML, matching the original falling through
/// to the generic failure body when `ET.fromstring` raises. A root whose
/// own `ret` attribute isn't `"ok"` yields an empty (not `None`) list,
/// matching the original's `{"ret": "ok", "logs": []}` fallback.
fn parse_clean_logs(xml: &str) -> Option<Vec<CleanLogEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text = true;
    let mut buf = Vec::new();
    let mut root_seen = false;
    let mut root_ok = false;
    let mut logs = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                if !root_seen {
                    root_seen = true;
                    root_ok = attr(&start, "ret").as_deref() == Some("ok");
                }
            }
            Ok(Event::Empty(start)) => {
                if !root_seen {
                    root_seen = true;
                    root_ok = attr(&start, "ret").as_deref() == Some("ok");
                } else if start.name().as_ref() == b"clean" {
                    logs.push(CleanLogEntry {
                        ts: attr(&start, "s").unwrap_or_default(),
                        area: attr(&start, "a").unwrap_or_default(),
                        last: attr(&start, "l").unwrap_or_default(),
                        clean_type: attr(&start, "t").unwrap_or_default(),
                    });
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
        buf.clear();
    }

    if !root_seen {
        return None;
    }
    if !root_ok {
        return Some(Vec::new());
    }
    Some(logs)
}

fn attr(start: &BytesStart, name: &str) -> Option<String> {
    start
        .attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Matches the original's `"".join(random.sample(string.ascii_letters, 6))`
/// request-id generator.
fn random_request_id() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..6).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_request_id_is_six_ascii_letters() {
        let id = random_request_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn reply_from_timeout_carries_err_common() {
        let reply = CommandReply::from_outcome(CommandOutcome::Timeout {
            request_id: "abcdef".to_string(),
        });
        assert_eq!(reply.ret, "fail");
        assert_eq!(reply.errno.as_deref(), Some(ERR_COMMON));
        assert!(reply.resp.is_none());
    }

    #[test]
    fn reply_from_ok_carries_parsed_json_response() {
        let reply = CommandReply::from_outcome(CommandOutcome::Ok {
            request_id: "abcdef".to_string(),
            response: r#"{"ret":"ok"}"#.to_string(),
        });
        assert_eq!(reply.ret, "ok");
        assert_eq!(reply.resp.unwrap()["ret"], "ok");
    }

    #[test]
    fn parse_clean_logs_maps_attrs_in_order() {
        let xml = r#"<ctl ret="ok"><clean s="1600000000" a="20" l="600" t="auto"/><clean s="1600086400" a="15" l="500" t="spot"/></ctl>"#;
        let logs = parse_clean_logs(xml).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(
            logs[0],
            CleanLogEntry {
                ts: "1600000000".to_string(),
                area: "20".to_string(),
                last: "600".to_string(),
                clean_type: "auto".to_string(),
            }
        );
        assert_eq!(logs[1].clean_type, "spot");
    }

    #[test]
    fn parse_clean_logs_empty_on_non_ok_root() {
        let logs = parse_clean_logs(r#"<ctl ret="fail"/>"#).unwrap();
        assert!(logs.is_empty());
    }

    #[test]
    fn parse_clean_logs_none_on_malformed_xml() {
        assert!(parse_clean_logs("not xml").is_none());
    }

    #[test]
    fn get_clean_logs_payload_matches_vendor_request() {
        assert_eq!(GET_CLEAN_LOGS_PAYLOAD, r#"<ctl count="30"/>"#);
    }
}
