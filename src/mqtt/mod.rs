// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT broker, wire codec, client-id authentication, and the two internal
//! MQTT clients (HelperBot and ProxyClient) that bridge into it.

mod auth;
mod broker;
mod codec;
mod helper_bot;
mod proxy;
mod topic;

pub use auth::{authenticate_app_client, classify_client_id, AuthDecision, ClientIdKind, PasswordFile};
pub use broker::{BrokerState, MqttBroker, MqttBrokerBuilder, MqttBrokerConfig};
pub use codec::{ConnAckCode, PacketType, RawPacket};
pub use helper_bot::{parse_json_response, CommandOutcome, DeviceCommand, HelperBot, PayloadType};
pub use proxy::ProxyClient;
pub use topic::{
    BroadcastTopic, ClassifiedTopic, P2pTopic, HELPER_BOT_CLASS, HELPER_BOT_CLIENT_ID, HELPER_BOT_RESOURCE,
    PROXY_HELPER_RESOURCE,
};
