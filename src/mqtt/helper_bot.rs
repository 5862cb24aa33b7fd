// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HelperBot: an in-process MQTT client that impersonates a logged-in app
//! so the command router can issue request/response commands to robots.
//!
//! Grounded in `bumper/mqtt/helper_bot.py`. The original's
//! `cachetools.TTLCache` pending-command map is replaced here with `moka`'s
//! synchronous cache, which gives the same capacity+TTL eviction without
//! hand-rolling a min-heap.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, instrument, warn};

use crate::error::{MqttError, Result};

use super::topic::{HELPER_BOT_CLASS, HELPER_BOT_CLIENT_ID, HELPER_BOT_RESOURCE};

/// Subscription filter HelperBot registers on connect: any command whose
/// receiver slot names HelperBot.
const HELPER_BOT_FILTER: &str = "iot/p2p/+/+/+/+/helperbot/bumper/helperbot/+/+/+";

/// Payload encoding requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// JSON-encoded payload.
    Json,
    /// Plain string payload.
    Text,
}

impl PayloadType {
    fn as_topic_segment(self) -> &'static str {
        match self {
            Self::Json => "j",
            Self::Text => "x",
        }
    }
}

/// A command to send to a device via HelperBot.
#[derive(Debug, Clone)]
pub struct DeviceCommand {
    /// Vendor command name.
    pub cmd_name: String,
    /// Target device id.
    pub to_id: String,
    /// Target device class.
    pub to_type: String,
    /// Target device resource.
    pub to_res: String,
    /// Payload encoding.
    pub payload_type: PayloadType,
    /// The payload itself, already serialized to its wire form.
    pub payload: String,
}

/// Outcome of a [`HelperBot::send_command`] call, matching the three
/// response shapes in the original (`ok`/timeout/`fail`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The device replied in time.
    Ok {
        /// Correlation id.
        request_id: String,
        /// Raw response payload.
        response: String,
    },
    /// No reply arrived within the configured timeout.
    Timeout {
        /// Correlation id.
        request_id: String,
    },
    /// Sending the command itself failed.
    Failed {
        /// Correlation id.
        request_id: String,
        /// Human-readable cause.
        debug: String,
    },
}

/// In-process MQTT client used as the bridge between the command router and
/// device sessions.
pub struct HelperBot {
    client: AsyncClient,
    pending: Cache<String, Arc<PendingCommand>>,
    timeout: Duration,
}

struct PendingCommand {
    reply: parking_lot::Mutex<Option<oneshot::Sender<String>>>,
}

impl HelperBot {
    /// Connects HelperBot to the local broker over TLS with certificate
    /// verification disabled, matching the original's
    /// `ssl_ctx.verify_mode = ssl.CERT_NONE`, and subscribes to its
    /// response filter.
    #[instrument(skip_all, fields(host = %host, port = port))]
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let mut options = MqttOptions::new(HELPER_BOT_CLIENT_ID, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: Vec::new(),
            alpn: None,
            client_auth: None,
        }));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        client
            .subscribe(HELPER_BOT_FILTER, QoS::AtMostOnce)
            .await
            .map_err(MqttError::Client)?;

        let pending: Cache<String, Arc<PendingCommand>> = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(timeout.mul_f32(1.1))
            .build();

        let loop_pending = pending.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        handle_incoming(&loop_pending, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "helperbot event loop error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client,
            pending,
            timeout,
        })
    }

    /// Sends a command to a device and awaits its response (or a timeout).
    #[instrument(skip(self, command), fields(cmd = %command.cmd_name, to = %command.to_id))]
    pub async fn send_command(&self, command: &DeviceCommand, request_id: &str) -> CommandOutcome {
        let topic = format!(
            "iot/p2p/{}/{HELPER_BOT_RESOURCE}/{HELPER_BOT_CLASS}/{HELPER_BOT_RESOURCE}/{}/{}/{}/q/{request_id}/{}",
            command.cmd_name,
            command.to_id,
            command.to_type,
            command.to_res,
            command.payload_type.as_topic_segment(),
        );

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.to_string(),
            Arc::new(PendingCommand {
                reply: parking_lot::Mutex::new(Some(tx)),
            }),
        );

        debug!(%topic, "sending command");
        let publish_result = self
            .client
            .publish(&topic, QoS::AtMostOnce, false, command.payload.clone())
            .await;

        let outcome = if let Err(e) = publish_result {
            CommandOutcome::Failed {
                request_id: request_id.to_string(),
                debug: e.to_string(),
            }
        } else {
            match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(response)) => CommandOutcome::Ok {
                    request_id: request_id.to_string(),
                    response,
                },
                Ok(Err(_)) | Err(_) => CommandOutcome::Timeout {
                    request_id: request_id.to_string(),
                },
            }
        };

        self.pending.invalidate(request_id);
        outcome
    }

    /// Publishes a raw message as HelperBot, used by [`super::proxy::ProxyClient`]
    /// to forward proxied upstream traffic onto the local broker.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(MqttError::Client)?;
        Ok(())
    }

    /// Disconnects from the broker.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await.map_err(MqttError::Client)?;
        Ok(())
    }
}

fn handle_incoming(pending: &Cache<String, Arc<PendingCommand>>, topic: &str, payload: &[u8]) {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 12 {
        warn!(%topic, "ignoring malformed helperbot response topic");
        return;
    }
    let request_id = parts[10];
    if let Some(pending_command) = pending.get(request_id) {
        let body = String::from_utf8_lossy(payload).into_owned();
        if let Some(tx) = pending_command.reply.lock().take() {
            let _ = tx.send(body);
        }
    }
}

/// Parses a JSON payload into a [`Value`] if the outcome carries one,
/// matching the original's `json.loads` when `payload_type == "j"`.
#[must_use]
pub fn parse_json_response(response: &str) -> Option<Value> {
    serde_json::from_str(response).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_topic_uses_helperbot_sender_slot() {
        let command = DeviceCommand {
            cmd_name: "clean".to_string(),
            to_id: "E000123".to_string(),
            to_type: "yna5xi".to_string(),
            to_res: "atom".to_string(),
            payload_type: PayloadType::Json,
            payload: "{}".to_string(),
        };
        let topic = format!(
            "iot/p2p/{}/{HELPER_BOT_RESOURCE}/{HELPER_BOT_CLASS}/{HELPER_BOT_RESOURCE}/{}/{}/{}/q/rid/{}",
            command.cmd_name,
            command.to_id,
            command.to_type,
            command.to_res,
            command.payload_type.as_topic_segment(),
        );
        assert_eq!(
            topic,
            "iot/p2p/clean/helperbot/bumper/helperbot/E000123/yna5xi/atom/q/rid/j"
        );
    }

    #[test]
    fn parse_json_response_parses_valid_json() {
        let value = parse_json_response(r#"{"ret":"ok"}"#).unwrap();
        assert_eq!(value["ret"], "ok");
    }

    #[test]
    fn parse_json_response_returns_none_for_invalid_json() {
        assert!(parse_json_response("not json").is_none());
    }

    #[test]
    fn handle_incoming_ignores_malformed_topic() {
        let cache: Cache<String, Arc<PendingCommand>> = Cache::builder().max_capacity(10).build();
        handle_incoming(&cache, "too/short", b"x");
        assert_eq!(cache.entry_count(), 0);
    }
}
