// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal MQTT 3.1.1 wire codec covering the subset this broker speaks:
//! CONNECT, CONNACK, PUBLISH, PUBACK, SUBSCRIBE, SUBACK, UNSUBSCRIBE,
//! UNSUBACK, PINGREQ, PINGRESP, DISCONNECT. No QoS 2 flows, no retained
//! message store, no will messages — the vendor firmware this broker talks
//! to doesn't exercise them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{MqttError, Result};

/// MQTT control packet types (top nibble of the fixed header's first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl PacketType {
    fn from_nibble(nibble: u8) -> Result<Self> {
        Ok(match nibble {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            other => return Err(MqttError::Protocol(format!("unknown packet type {other}")).into()),
        })
    }
}

/// A raw, decoded MQTT packet: its type, header flags, and remaining-length
/// payload.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub packet_type: PacketType,
    pub flags: u8,
    pub payload: Bytes,
}

/// Reads one MQTT packet from an async stream, or `None` on clean EOF.
pub async fn read_packet<R: tokio::io::AsyncRead + Unpin>(stream: &mut R) -> Result<Option<RawPacket>> {
    let first = match stream.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MqttError::Io(e).into()),
    };
    let packet_type = PacketType::from_nibble(first >> 4)?;
    let flags = first & 0x0F;

    let remaining_length = read_remaining_length(stream).await?;
    let mut buf = vec![0_u8; remaining_length];
    stream.read_exact(&mut buf).await.map_err(MqttError::Io)?;

    Ok(Some(RawPacket {
        packet_type,
        flags,
        payload: Bytes::from(buf),
    }))
}

async fn read_remaining_length<R: tokio::io::AsyncRead + Unpin>(stream: &mut R) -> Result<usize> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    loop {
        let byte = stream.read_u8().await.map_err(MqttError::Io)?;
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
        if multiplier > 128 * 128 * 128 {
            return Err(MqttError::Protocol("remaining length too large".to_string()).into());
        }
    }
    Ok(value)
}

fn encode_remaining_length(mut value: usize, out: &mut BytesMut) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn encode_fixed_header(packet_type_nibble: u8, flags: u8, remaining_length: usize) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8((packet_type_nibble << 4) | flags);
    encode_remaining_length(remaining_length, &mut out);
    out
}

fn read_utf8_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(MqttError::Protocol("truncated string length".to_string()).into());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::Protocol("truncated string body".to_string()).into());
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| MqttError::Protocol("invalid utf-8".to_string()).into())
}

fn put_utf8_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

/// A decoded CONNECT packet.
#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

/// Decodes a CONNECT packet's variable header and payload.
pub fn decode_connect(mut payload: Bytes) -> Result<ConnectPacket> {
    let protocol_name = read_utf8_string(&mut payload)?;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(MqttError::Protocol(format!("unexpected protocol name {protocol_name}")).into());
    }
    if payload.remaining() < 2 {
        return Err(MqttError::Protocol("truncated CONNECT header".to_string()).into());
    }
    let _protocol_level = payload.get_u8();
    let connect_flags = payload.get_u8();
    let keep_alive = payload.get_u16();

    let has_username = connect_flags & 0x80 != 0;
    let has_password = connect_flags & 0x40 != 0;
    let clean_session = connect_flags & 0x02 != 0;

    let client_id = read_utf8_string(&mut payload)?;
    let username = if has_username {
        Some(read_utf8_string(&mut payload)?)
    } else {
        None
    };
    let password = if has_password {
        Some(read_utf8_string(&mut payload)?)
    } else {
        None
    };

    Ok(ConnectPacket {
        client_id,
        username,
        password,
        keep_alive,
        clean_session,
    })
}

/// CONNACK return codes (the subset we ever send).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAckCode {
    Accepted,
    BadCredentials,
    NotAuthorized,
}

impl ConnAckCode {
    fn code(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
        }
    }
}

/// Encodes a CONNACK packet.
#[must_use]
pub fn encode_connack(code: ConnAckCode) -> BytesMut {
    let mut header = encode_fixed_header(2, 0, 2);
    header.put_u8(0); // session present: always 0, we keep no persistent sessions
    header.put_u8(code.code());
    header
}

/// A decoded PUBLISH packet.
#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// Decodes a PUBLISH packet given its header flags and payload.
pub fn decode_publish(flags: u8, mut payload: Bytes) -> Result<PublishPacket> {
    let qos = (flags >> 1) & 0x03;
    let retain = flags & 0x01 != 0;
    let topic = read_utf8_string(&mut payload)?;
    let packet_id = if qos > 0 {
        if payload.remaining() < 2 {
            return Err(MqttError::Protocol("truncated packet id".to_string()).into());
        }
        Some(payload.get_u16())
    } else {
        None
    };
    Ok(PublishPacket {
        topic,
        qos,
        retain,
        packet_id,
        payload,
    })
}

/// Encodes a PUBLISH packet at QoS 0 or 1.
#[must_use]
pub fn encode_publish(topic: &str, qos: u8, packet_id: Option<u16>, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    put_utf8_string(&mut body, topic);
    if let Some(id) = packet_id {
        body.put_u16(id);
    }
    body.put_slice(payload);

    let flags = (qos & 0x03) << 1;
    let mut out = encode_fixed_header(3, flags, body.len());
    out.put_slice(&body);
    out
}

/// Encodes a PUBACK packet.
#[must_use]
pub fn encode_puback(packet_id: u16) -> BytesMut {
    let mut out = encode_fixed_header(4, 0, 2);
    out.put_u16(packet_id);
    out
}

/// A decoded SUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<(String, u8)>,
}

/// Decodes a SUBSCRIBE packet.
pub fn decode_subscribe(mut payload: Bytes) -> Result<SubscribePacket> {
    if payload.remaining() < 2 {
        return Err(MqttError::Protocol("truncated SUBSCRIBE".to_string()).into());
    }
    let packet_id = payload.get_u16();
    let mut filters = Vec::new();
    while payload.has_remaining() {
        let filter = read_utf8_string(&mut payload)?;
        if !payload.has_remaining() {
            return Err(MqttError::Protocol("missing QoS byte".to_string()).into());
        }
        let qos = payload.get_u8();
        filters.push((filter, qos));
    }
    Ok(SubscribePacket { packet_id, filters })
}

/// Encodes a SUBACK packet granting the requested QoS for each filter.
#[must_use]
pub fn encode_suback(packet_id: u16, granted: &[u8]) -> BytesMut {
    let mut out = encode_fixed_header(9, 0, 2 + granted.len());
    out.put_u16(packet_id);
    out.put_slice(granted);
    out
}

/// A decoded UNSUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// Decodes an UNSUBSCRIBE packet.
pub fn decode_unsubscribe(mut payload: Bytes) -> Result<UnsubscribePacket> {
    if payload.remaining() < 2 {
        return Err(MqttError::Protocol("truncated UNSUBSCRIBE".to_string()).into());
    }
    let packet_id = payload.get_u16();
    let mut filters = Vec::new();
    while payload.has_remaining() {
        filters.push(read_utf8_string(&mut payload)?);
    }
    Ok(UnsubscribePacket { packet_id, filters })
}

/// Encodes an UNSUBACK packet.
#[must_use]
pub fn encode_unsuback(packet_id: u16) -> BytesMut {
    let mut out = encode_fixed_header(11, 0, 2);
    out.put_u16(packet_id);
    out
}

/// Encodes a PINGRESP packet.
#[must_use]
pub fn encode_pingresp() -> BytesMut {
    encode_fixed_header(13, 0, 0)
}

/// Writes a packet buffer to an async stream.
pub async fn write_packet<W: tokio::io::AsyncWrite + Unpin>(stream: &mut W, packet: &[u8]) -> Result<()> {
    stream.write_all(packet).await.map_err(MqttError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_payload(client_id: &str, username: Option<&str>, password: Option<&str>) -> Bytes {
        let mut out = BytesMut::new();
        put_utf8_string(&mut out, "MQTT");
        out.put_u8(4); // protocol level
        let mut flags = 0x02; // clean session
        if username.is_some() {
            flags |= 0x80;
        }
        if password.is_some() {
            flags |= 0x40;
        }
        out.put_u8(flags);
        out.put_u16(60);
        put_utf8_string(&mut out, client_id);
        if let Some(u) = username {
            put_utf8_string(&mut out, u);
        }
        if let Some(p) = password {
            put_utf8_string(&mut out, p);
        }
        out.freeze()
    }

    #[test]
    fn decodes_connect_with_credentials() {
        let payload = connect_payload("helperbot@bumper/helperbot", Some("user"), Some("pass"));
        let connect = decode_connect(payload).unwrap();
        assert_eq!(connect.client_id, "helperbot@bumper/helperbot");
        assert_eq!(connect.username.as_deref(), Some("user"));
        assert_eq!(connect.password.as_deref(), Some("pass"));
        assert!(connect.clean_session);
        assert_eq!(connect.keep_alive, 60);
    }

    #[test]
    fn decodes_connect_without_credentials() {
        let payload = connect_payload("bot@class.ecorobot.net/atom", None, None);
        let connect = decode_connect(payload).unwrap();
        assert!(connect.username.is_none());
        assert!(connect.password.is_none());
    }

    #[test]
    fn publish_round_trips_qos0() {
        let encoded = encode_publish("iot/atr/event/did/cls/res/j", 0, None, b"hello");
        let mut bytes = encoded.freeze();
        let first = bytes.get_u8();
        let packet_type = PacketType::from_nibble(first >> 4).unwrap();
        assert!(matches!(packet_type, PacketType::Publish));

        let len = bytes.get_u8() as usize;
        let body = bytes.copy_to_bytes(len);
        let decoded = decode_publish(0, body).unwrap();
        assert_eq!(decoded.topic, "iot/atr/event/did/cls/res/j");
        assert_eq!(decoded.payload.as_ref(), b"hello");
        assert_eq!(decoded.qos, 0);
        assert!(decoded.packet_id.is_none());
    }

    #[test]
    fn publish_round_trips_qos1_with_packet_id() {
        let encoded = encode_publish("a/b", 1, Some(42), b"x");
        let mut bytes = encoded.freeze();
        let first = bytes.get_u8();
        assert_eq!(first >> 4, 3);
        let flags = first & 0x0F;
        let len = bytes.get_u8() as usize;
        let body = bytes.copy_to_bytes(len);
        let decoded = decode_publish(flags, body).unwrap();
        assert_eq!(decoded.qos, 1);
        assert_eq!(decoded.packet_id, Some(42));
    }

    #[test]
    fn subscribe_decodes_multiple_filters() {
        let mut body = BytesMut::new();
        body.put_u16(7);
        put_utf8_string(&mut body, "iot/p2p/+/+/+/+/helperbot/bumper/helperbot/+/+/+");
        body.put_u8(0);
        put_utf8_string(&mut body, "iot/atr/#");
        body.put_u8(1);

        let decoded = decode_subscribe(body.freeze()).unwrap();
        assert_eq!(decoded.packet_id, 7);
        assert_eq!(decoded.filters.len(), 2);
        assert_eq!(decoded.filters[1].1, 1);
    }

    #[test]
    fn connack_encodes_expected_bytes() {
        let encoded = encode_connack(ConnAckCode::Accepted);
        assert_eq!(&encoded[..], &[0x20, 0x02, 0x00, 0x00]);
    }
}
