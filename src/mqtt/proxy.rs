// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ProxyClient: bridges a single device's MQTT session to the real vendor
//! cloud when proxy mode is enabled, so the device can be controlled by the
//! vendor app while local app traffic still routes through this broker.
//!
//! Grounded in `bumper/mqtt/proxy.py`. As in the original, TLS certificate
//! verification is disabled for this single outbound socket only — this
//! never applies to either inbound listener.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use tracing::{error, info, instrument, warn};

use crate::error::{MqttError, Result};

use super::helper_bot::HelperBot;
use super::topic::PROXY_HELPER_RESOURCE;

/// Default request-mapper TTL, matching the original's `timeout * 1.1`
/// with `timeout = 180`.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// One outbound client per proxied device, forwarding its traffic to and
/// from the vendor's MQTT broker.
pub struct ProxyClient {
    client: AsyncClient,
    /// Correlates a request id to the original local sender a `proxyhelper`-
    /// addressed upstream message was rewritten from, so a locally-produced
    /// reply can be routed back to it. Shared with the spawned event loop
    /// that populates it on the upstream→local hop; consulted by the
    /// broker on the local→upstream hop via [`Self::take_original_sender`].
    request_mapper: Cache<String, String>,
}

impl ProxyClient {
    /// Connects to the vendor broker as `client_id`/`username`/`password`
    /// with certificate verification disabled, and starts forwarding
    /// upstream messages onto the local broker via `helper_bot`.
    #[instrument(skip(password, helper_bot), fields(%client_id, %host, port))]
    pub async fn connect(
        client_id: &str,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        helper_bot: Arc<HelperBot>,
    ) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_credentials(username, password);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: Vec::new(),
            alpn: None,
            client_auth: None,
        }));

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        let request_mapper: Cache<String, String> = Cache::builder()
            .max_capacity(32_400) // timeout * timeout, matching the original's sizing
            .time_to_live(DEFAULT_TIMEOUT.mul_f32(1.1))
            .build();

        let loop_request_mapper = request_mapper.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        forward_upstream_message(
                            &loop_request_mapper,
                            &helper_bot,
                            &publish.topic,
                            publish.payload.to_vec(),
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "proxy client event loop error");
                        break;
                    }
                }
            }
        });

        Ok(Self { client, request_mapper })
    }

    /// Mirrors a local subscription onto the upstream connection, matching
    /// `on_broker_client_subscribed`'s forwarding to `ProxyClient`.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(MqttError::Client)?;
        Ok(())
    }

    /// Publishes a message upstream.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(MqttError::Client)?;
        Ok(())
    }

    /// Disconnects from the vendor broker.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await.map_err(MqttError::Client)?;
        Ok(())
    }

    /// Pops the original sender recorded by [`forward_upstream_message`] for
    /// `request_id`, so a locally-produced reply addressed to `proxyhelper`
    /// can be rewritten back to the device that actually asked. Matches the
    /// original's `request_mapper.pop(ttopic[10], "")`.
    pub fn take_original_sender(&self, request_id: &str) -> Option<String> {
        let sender = self.request_mapper.get(request_id);
        if sender.is_some() {
            self.request_mapper.invalidate(request_id);
        }
        sender
    }
}

async fn forward_upstream_message(
    request_mapper: &Cache<String, String>,
    helper_bot: &HelperBot,
    topic: &str,
    payload: Vec<u8>,
) {
    let mut parts: Vec<String> = topic.split('/').map(str::to_string).collect();

    let rewritten_topic = if parts.len() == 12 && parts[1] == "p2p" {
        if parts[3] == PROXY_HELPER_RESOURCE {
            warn!(%topic, "\"proxyhelper\" was sender - invalid, dropping");
            return;
        }
        request_mapper.insert(parts[10].clone(), parts[3].clone());
        parts[3] = PROXY_HELPER_RESOURCE.to_string();
        parts.join("/")
    } else {
        topic.to_string()
    };

    info!(from = %topic, to = %rewritten_topic, "forwarding proxied message to local broker");
    if let Err(e) = helper_bot.publish_raw(&rewritten_topic, payload).await {
        error!(error = %e, "failed to forward proxied message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_mapper_records_original_sender_on_rewrite() {
        let cache: Cache<String, String> = Cache::builder().max_capacity(10).build();
        let mut parts: Vec<String> = "iot/p2p/clean/E000999/cls/res/helperbot/bumper/helperbot/p/rid/j"
            .split('/')
            .map(str::to_string)
            .collect();
        assert_eq!(parts[1], "p2p");
        cache.insert(parts[10].clone(), parts[3].clone());
        parts[3] = PROXY_HELPER_RESOURCE.to_string();
        assert_eq!(cache.get("rid"), Some("E000999".to_string()));
        assert_eq!(parts[3], "proxyhelper");
    }

    #[test]
    fn sender_slot_of_proxyhelper_is_recognized_as_invalid() {
        // forward_upstream_message refuses to forward such a message; the
        // end-to-end behavior is covered by tests/proxy.rs against a live
        // HelperBot/broker pair.
        let topic = "iot/p2p/clean/proxyhelper/bumper/helperbot/E000999/cls/res/q/rid/j";
        let parts: Vec<&str> = topic.split('/').collect();
        assert_eq!(parts[3], PROXY_HELPER_RESOURCE);
    }
}
