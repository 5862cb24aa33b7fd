// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic grammar for the vendor's two MQTT topic families:
//!
//! - P2P: `iot/p2p/{cmd}/{sender_did}/{sender_cls}/{sender_res}/{recv_did}/
//!   {recv_cls}/{recv_res}/{q|p}/{request_id}/{j|x}`
//! - Broadcast/telemetry: `iot/atr/{event}/{bot_did}/{bot_cls}/{bot_res}/{j|x}`

use crate::error::{MqttError, Result};

/// The literal resource HelperBot always uses as sender and (unused) receiver.
pub const HELPER_BOT_RESOURCE: &str = "helperbot";
/// The literal class HelperBot always uses.
pub const HELPER_BOT_CLASS: &str = "bumper";
/// HelperBot's fixed MQTT client id.
pub const HELPER_BOT_CLIENT_ID: &str = "helperbot@bumper/helperbot";
/// The sender segment ProxyClient rewrites upstream commands to.
pub const PROXY_HELPER_RESOURCE: &str = "proxyhelper";

/// A parsed `iot/p2p/...` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2pTopic {
    /// Segment 2: command name.
    pub command: String,
    /// Segment 3: sender device id.
    pub sender_did: String,
    /// Segment 4: sender device class.
    pub sender_class: String,
    /// Segment 5: sender resource.
    pub sender_resource: String,
    /// Segment 6: receiver device id.
    pub receiver_did: String,
    /// Segment 7: receiver device class.
    pub receiver_class: String,
    /// Segment 8: receiver resource.
    pub receiver_resource: String,
    /// Segment 9: `q` (request) or `p` (response).
    pub direction: String,
    /// Segment 10: correlation id.
    pub request_id: String,
    /// Segment 11: `j` (JSON) or `x` (plain string) payload encoding.
    pub payload_type: String,
}

impl P2pTopic {
    /// Parses an 11-segment P2P topic, failing if the segment count or
    /// literal prefix don't match.
    pub fn parse(topic: &str) -> Result<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != 12 || parts[0] != "iot" || parts[1] != "p2p" {
            return Err(MqttError::MalformedTopic(topic.to_string()).into());
        }
        Ok(Self {
            command: parts[2].to_string(),
            sender_did: parts[3].to_string(),
            sender_class: parts[4].to_string(),
            sender_resource: parts[5].to_string(),
            receiver_did: parts[6].to_string(),
            receiver_class: parts[7].to_string(),
            receiver_resource: parts[8].to_string(),
            direction: parts[9].to_string(),
            request_id: parts[10].to_string(),
            payload_type: parts[11].to_string(),
        })
    }

    /// Renders this topic back to its wire form.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "iot/p2p/{}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
            self.command,
            self.sender_did,
            self.sender_class,
            self.sender_resource,
            self.receiver_did,
            self.receiver_class,
            self.receiver_resource,
            self.direction,
            self.request_id,
            self.payload_type
        )
    }

    /// `true` if segment 6 (the receiver did slot, reused by HelperBot
    /// responses) names HelperBot — the original's "Received Response"
    /// disambiguation.
    #[must_use]
    pub fn is_response_to_helper_bot(&self) -> bool {
        self.receiver_did == HELPER_BOT_RESOURCE
    }

    /// `true` if segment 3 (the sender slot) names HelperBot — the
    /// original's "Send Command" disambiguation.
    #[must_use]
    pub fn is_command_from_helper_bot(&self) -> bool {
        self.sender_did == HELPER_BOT_RESOURCE
    }
}

/// A parsed `iot/atr/...` broadcast/telemetry topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTopic {
    /// Segment 2: event name.
    pub event: String,
    /// Segment 3: reporting device id.
    pub bot_did: String,
    /// Segment 4: reporting device class.
    pub bot_class: String,
    /// Segment 5: reporting resource.
    pub bot_resource: String,
    /// Segment 6: `j` or `x` payload encoding.
    pub payload_type: String,
}

impl BroadcastTopic {
    /// Parses a 7-segment broadcast topic.
    pub fn parse(topic: &str) -> Result<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != 7 || parts[0] != "iot" || parts[1] != "atr" {
            return Err(MqttError::MalformedTopic(topic.to_string()).into());
        }
        Ok(Self {
            event: parts[2].to_string(),
            bot_did: parts[3].to_string(),
            bot_class: parts[4].to_string(),
            bot_resource: parts[5].to_string(),
            payload_type: parts[6].to_string(),
        })
    }
}

/// Classifies a raw topic as P2P, broadcast, or neither, mirroring the
/// dispatch order `on_broker_message_received` uses in the original:
/// response-to-helperbot, command-from-helperbot, broadcast, generic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedTopic {
    /// A response routed back to HelperBot.
    HelperBotResponse(P2pTopic),
    /// A command routed from HelperBot to a device.
    HelperBotCommand(P2pTopic),
    /// A generic peer-to-peer message (neither endpoint is HelperBot).
    PeerToPeer(P2pTopic),
    /// A broadcast/telemetry report.
    Broadcast(BroadcastTopic),
}

/// Classifies `topic`, matching the original's segment-based disambiguation
/// order exactly: response (`[6]`) before command (`[3]`) before broadcast
/// (`[1]`) before generic fallback.
pub fn classify(topic: &str) -> Result<ClassifiedTopic> {
    if let Ok(p2p) = P2pTopic::parse(topic) {
        return Ok(if p2p.is_response_to_helper_bot() {
            ClassifiedTopic::HelperBotResponse(p2p)
        } else if p2p.is_command_from_helper_bot() {
            ClassifiedTopic::HelperBotCommand(p2p)
        } else {
            ClassifiedTopic::PeerToPeer(p2p)
        });
    }
    Ok(ClassifiedTopic::Broadcast(BroadcastTopic::parse(topic)?))
}

/// Matches a concrete topic against an MQTT subscription filter, supporting
/// the `+` (single-level) and `#` (multi-level, trailing-only) wildcards.
#[must_use]
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;
    while fi < filter_parts.len() {
        match filter_parts[fi] {
            "#" => return true,
            "+" => {
                if ti >= topic_parts.len() {
                    return false;
                }
            }
            literal => {
                if ti >= topic_parts.len() || topic_parts[ti] != literal {
                    return false;
                }
            }
        }
        fi += 1;
        ti += 1;
    }
    ti == topic_parts.len()
}
