// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests against a live [`MqttBroker`] over TLS: CONNECT
//! acceptance/rejection by client-id shape, and session bookkeeping.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bumper::event::EventBus;
use bumper::identity::IdentityStore;
use bumper::mqtt::MqttBroker;
use bytes::{BufMut, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

fn put_utf8_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

/// Hand-builds a CONNECT packet — the broker's wire codec is a private
/// implementation detail, so the test drives the real TCP+TLS wire like any
/// other client would.
fn connect_packet(client_id: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    put_utf8_string(&mut body, "MQTT");
    body.put_u8(4); // protocol level
    body.put_u8(0x02); // clean session, no credentials
    body.put_u16(60); // keep alive
    put_utf8_string(&mut body, client_id);

    let mut out = BytesMut::new();
    out.put_u8(1 << 4); // CONNECT
    out.put_u8(body.len() as u8); // remaining length fits in one byte for these tests
    out.extend_from_slice(&body);
    out.to_vec()
}

async fn connect_and_read_connack(addr: std::net::SocketAddr, client_id: &str) -> u8 {
    let tcp = TcpStream::connect(addr).await.expect("tcp connect");
    let connector = support::test_connector();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.expect("tls handshake");

    tls.write_all(&connect_packet(client_id)).await.unwrap();

    let mut header = [0_u8; 2];
    tls.read_exact(&mut header).await.expect("read connack header");
    assert_eq!(header[0] >> 4, 2, "expected a CONNACK packet");
    let mut body = vec![0_u8; header[1] as usize];
    tls.read_exact(&mut body).await.expect("read connack body");
    body[1]
}

async fn start_test_broker(use_auth: bool) -> (MqttBroker, std::net::SocketAddr) {
    let port = support::test_port();
    let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let settings = support::test_settings("127.0.0.1", port, support::test_port());
    let acceptor = support::test_acceptor(&settings);

    let identity = Arc::new(IdentityStore::open_in_memory(EventBus::new()).unwrap());
    let broker = MqttBroker::builder()
        .listen_addr(addr)
        .identity(identity)
        .events(EventBus::new())
        .use_auth(use_auth)
        .allow_anonymous(!use_auth)
        .build()
        .await
        .expect("broker builds");
    broker.start(acceptor).await.expect("broker starts");
    (broker, addr)
}

#[tokio::test]
async fn bot_client_id_is_accepted_and_counted() {
    let (broker, addr) = start_test_broker(false).await;

    let code = connect_and_read_connack(addr, "E0000000000000001234@159.ecorobot.net/atom").await;
    assert_eq!(code, 0, "expected CONNACK accepted");

    sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.session_count().await, 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn app_client_is_accepted_when_anonymous_allowed() {
    let (broker, addr) = start_test_broker(false).await;

    let code = connect_and_read_connack(addr, "fuid_tmpuser@ecouser.net/IOSF53D07BA").await;
    assert_eq!(code, 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn client_id_without_at_sign_is_rejected() {
    let (broker, addr) = start_test_broker(false).await;

    let code = connect_and_read_connack(addr, "not-a-valid-client-id").await;
    assert_eq!(code, 5, "expected CONNACK not-authorized");

    broker.shutdown().await;
}

#[tokio::test]
async fn helper_bot_is_connected_once_broker_has_started() {
    let (broker, _addr) = start_test_broker(false).await;
    assert!(broker.helper_bot().await.is_some());
    broker.shutdown().await;
}
