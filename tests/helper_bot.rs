// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests for [`CommandRouter`]: the `DeviceNotConnected` guard,
//! and a full round trip through a live [`MqttBroker`]'s internal HelperBot
//! to a mock device and back.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bumper::error::Error;
use bumper::event::EventBus;
use bumper::identity::{Device, IdentityStore};
use bumper::mqtt::{MqttBroker, PayloadType};
use bumper::router::CommandRouter;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};

async fn start_test_broker() -> (MqttBroker, std::net::SocketAddr, Arc<IdentityStore>) {
    let port = support::test_port();
    let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let settings = support::test_settings("127.0.0.1", port, support::test_port());
    let acceptor = support::test_acceptor(&settings);

    let identity = Arc::new(IdentityStore::open_in_memory(EventBus::new()).unwrap());
    let broker = MqttBroker::builder()
        .listen_addr(addr)
        .identity(Arc::clone(&identity))
        .events(EventBus::new())
        .use_auth(false)
        .allow_anonymous(true)
        .build()
        .await
        .expect("broker builds");
    broker.start(acceptor).await.expect("broker starts");
    (broker, addr, identity)
}

#[tokio::test]
async fn send_command_rejects_unknown_device() {
    let (broker, _addr, identity) = start_test_broker().await;
    let helper_bot = broker.helper_bot().await.expect("helper bot connected");
    let router = CommandRouter::new(identity, helper_bot);

    let err = router
        .send_command("no-such-device", "GetCleanState", PayloadType::Json, "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Router(_)));

    broker.shutdown().await;
}

#[tokio::test]
async fn send_command_rejects_device_without_live_mqtt_session() {
    let (broker, _addr, identity) = start_test_broker().await;
    identity.bot_add(&Device::new("E000123", "yna5xi", "atom")).unwrap();
    let helper_bot = broker.helper_bot().await.expect("helper bot connected");
    let router = CommandRouter::new(identity, helper_bot);

    let err = router
        .send_command("E000123", "GetCleanState", PayloadType::Json, "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Router(_)));

    broker.shutdown().await;
}

#[tokio::test]
async fn send_command_round_trips_through_a_mock_device() {
    let (broker, addr, identity) = start_test_broker().await;
    let did = "E000123";
    let class = "yna5xi";
    let resource = "atom";

    let mut device = Device::new(did, class, resource);
    device.mqtt_connection = true;
    identity.bot_add(&device).unwrap();

    // A mock device: subscribes to its own P2P inbox and echoes back an "ok"
    // response on whatever command it receives, the way a real bot would.
    let mut options = MqttOptions::new(
        format!("{did}@{class}.ecorobot.net/{resource}"),
        addr.ip().to_string(),
        addr.port(),
    );
    options.set_keep_alive(Duration::from_secs(30));
    options.set_transport(Transport::Tls(TlsConfiguration::Simple {
        ca: Vec::new(),
        alpn: None,
        client_auth: None,
    }));
    let (device_client, mut device_event_loop) = AsyncClient::new(options, 16);
    device_client
        .subscribe(
            format!("iot/p2p/+/+/+/+/{did}/{class}/{resource}/+/+/+"),
            QoS::AtMostOnce,
        )
        .await
        .expect("device subscribe");

    tokio::spawn(async move {
        loop {
            match device_event_loop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let parts: Vec<&str> = publish.topic.split('/').collect();
                    if parts.len() != 12 {
                        continue;
                    }
                    let reply_topic = format!(
                        "iot/p2p/{}/{did}/{class}/{resource}/helperbot/bumper/helperbot/p/{}/{}",
                        parts[2], parts[10], parts[11]
                    );
                    let _ = device_client
                        .publish(reply_topic, QoS::AtMostOnce, false, r#"{"ret":"ok"}"#)
                        .await;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    // Give the mock device's subscription time to register before the
    // command is sent.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let helper_bot = broker.helper_bot().await.expect("helper bot connected");
    let router = CommandRouter::new(identity, helper_bot);
    let reply = router
        .send_command(did, "GetCleanState", PayloadType::Json, "{}")
        .await
        .expect("command send succeeds");

    assert_eq!(reply.ret, "ok");
    assert_eq!(reply.resp.unwrap()["ret"], "ok");

    broker.shutdown().await;
}
