// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests for [`ProxyClient`] against a live HelperBot/broker
//! pair: a second local [`MqttBroker`] stands in for the vendor's upstream
//! broker, and messages published there are forwarded onto the real local
//! broker with the sender segment rewritten to `proxyhelper`.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bumper::event::EventBus;
use bumper::identity::IdentityStore;
use bumper::mqtt::{MqttBroker, ProxyClient};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn start_broker() -> (MqttBroker, std::net::SocketAddr) {
    let port = support::test_port();
    let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let settings = support::test_settings("127.0.0.1", port, support::test_port());
    let acceptor = support::test_acceptor(&settings);

    let identity = Arc::new(IdentityStore::open_in_memory(EventBus::new()).unwrap());
    let broker = MqttBroker::builder()
        .listen_addr(addr)
        .identity(identity)
        .events(EventBus::new())
        .use_auth(false)
        .allow_anonymous(true)
        .build()
        .await
        .expect("broker builds");
    broker.start(acceptor).await.expect("broker starts");
    (broker, addr)
}

/// Subscribes a plain observer client to the local broker and forwards every
/// publish it sees onto `tx`, so the test can await what ProxyClient forwards.
async fn spawn_observer(addr: std::net::SocketAddr, filter: &str) -> mpsc::Receiver<(String, Vec<u8>)> {
    let mut options = MqttOptions::new("fuid_observer@ecouser.net/watcher", addr.ip().to_string(), addr.port());
    options.set_keep_alive(Duration::from_secs(30));
    options.set_transport(Transport::Tls(TlsConfiguration::Simple {
        ca: Vec::new(),
        alpn: None,
        client_auth: None,
    }));
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    client.subscribe(filter, QoS::AtMostOnce).await.expect("observer subscribe");

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if tx.send((publish.topic, publish.payload.to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    rx
}

async fn publish_upstream(addr: std::net::SocketAddr, topic: &str, payload: &str) {
    let mut options = MqttOptions::new("vendor-sender@ecouser.net/res", addr.ip().to_string(), addr.port());
    options.set_keep_alive(Duration::from_secs(30));
    options.set_transport(Transport::Tls(TlsConfiguration::Simple {
        ca: Vec::new(),
        alpn: None,
        client_auth: None,
    }));
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    tokio::spawn(async move {
        while event_loop.poll().await.is_ok() {}
    });
    client
        .publish(topic, QoS::AtMostOnce, false, payload)
        .await
        .expect("publish to upstream broker");
}

#[tokio::test]
async fn forwards_upstream_p2p_message_with_rewritten_sender() {
    let (local_broker, local_addr) = start_broker().await;
    let (upstream_broker, upstream_addr) = start_broker().await;

    let helper_bot = local_broker.helper_bot().await.expect("local helper bot connected");
    let proxy = ProxyClient::connect(
        "proxyclient",
        &upstream_addr.ip().to_string(),
        upstream_addr.port(),
        "user",
        "pass",
        helper_bot,
    )
    .await
    .expect("proxy connects upstream");
    proxy
        .subscribe("iot/p2p/+/+/+/+/+/+/+/+/+/+")
        .await
        .expect("proxy subscribes upstream");

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut observed = spawn_observer(local_addr, "iot/p2p/+/+/+/+/+/+/+/+/+/+").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    publish_upstream(
        upstream_addr,
        "iot/p2p/clean/E000999/cls/res/helperbot/bumper/helperbot/p/rid1/j",
        r#"{"ret":"ok"}"#,
    )
    .await;

    let (topic, _payload) = timeout(Duration::from_secs(2), observed.recv())
        .await
        .expect("observer should see forwarded message")
        .expect("channel still open");
    assert_eq!(topic, "iot/p2p/clean/proxyhelper/cls/res/helperbot/bumper/helperbot/p/rid1/j");
    assert!(!topic.contains("E000999"));

    publish_upstream(
        upstream_addr,
        "iot/p2p/clean/proxyhelper/bumper/helperbot/E000999/cls/res/q/rid2/j",
        r#"{"ret":"ok"}"#,
    )
    .await;

    let dropped = timeout(Duration::from_millis(500), observed.recv()).await;
    assert!(dropped.is_err(), "a proxyhelper-sourced message must not be forwarded");

    local_broker.shutdown().await;
    upstream_broker.shutdown().await;
}
