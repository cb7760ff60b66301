//! Java edition handshake, status and login packets.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::{CodecError, Packet};
use crate::infrared::net;

pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;
pub const LOGIN_START_ID: i32 = 0x00;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;

pub const STATE_STATUS: i32 = 1;
pub const STATE_LOGIN: i32 = 2;
pub const STATE_TRANSFER: i32 = 3;

/// Handshake cap for plain gateways.
pub const MAX_HANDSHAKE_LEN: usize = 264;
/// Handshake cap when the host field may carry a signed real-IP payload.
pub const MAX_REAL_IP_HANDSHAKE_LEN: usize = 1 + 2 + 255 * 4 + 2 + 1;
pub const MAX_STATUS_REQUEST_LEN: usize = 1;
pub const MAX_PING_LEN: usize = 1 + 8;
pub const MAX_LOGIN_START_LEN: usize = 4096;
pub const MAX_STATUS_RESPONSE_LEN: usize = 1 + 3 + 32767 * 4;

pub const MAX_SERVER_ADDRESS_CHARS: usize = 255;
pub const MAX_USERNAME_CHARS: usize = 16;
pub const MAX_CHAT_CHARS: usize = 262_144;
pub const MAX_STATUS_JSON_CHARS: usize = 32767;

pub const FORGE_SEPARATOR: char = '\0';
pub const REAL_IP_SEPARATOR: &str = "///";

fn expect_id(packet: &Packet, expected: i32) -> Result<(), CodecError> {
    if packet.id != expected {
        return Err(CodecError::UnexpectedPacketId {
            expected,
            got: packet.id,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    pub fn decode(packet: &Packet) -> Result<Self, CodecError> {
        expect_id(packet, HANDSHAKE_ID)?;
        let mut r = packet.reader();
        let protocol_version = r.read_varint()?;
        // Real-IP payloads push the raw field past the vanilla 255 character limit.
        let server_address = r.read_string(MAX_SERVER_ADDRESS_CHARS * 4)?;
        let server_port = r.read_u16_be()?;
        let next_state = r.read_varint()?;
        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    pub fn encode(&self) -> Packet {
        Packet::build(HANDSHAKE_ID, |w| {
            w.write_varint(self.protocol_version);
            w.write_string(&self.server_address);
            w.write_u16_be(self.server_port);
            w.write_varint(self.next_state);
        })
    }

    pub fn is_status_request(&self) -> bool {
        self.next_state == STATE_STATUS
    }

    pub fn is_login_request(&self) -> bool {
        self.next_state == STATE_LOGIN || self.next_state == STATE_TRANSFER
    }

    pub fn is_forge_address(&self) -> bool {
        self.server_address.contains(FORGE_SEPARATOR)
    }

    pub fn is_real_ip_address(&self) -> bool {
        self.server_address.contains(REAL_IP_SEPARATOR)
    }

    /// Host part of the address field: everything before the Forge and real-IP
    /// markers, with surrounding dots trimmed. The port, if any, is kept.
    pub fn parse_server_address(&self) -> &str {
        let addr = self
            .server_address
            .split(FORGE_SEPARATOR)
            .next()
            .unwrap_or_default();
        let addr = addr.split(REAL_IP_SEPARATOR).next().unwrap_or_default();
        addr.trim_matches('.')
    }

    /// Lowercased host used for routing, without port.
    pub fn routing_key(&self) -> String {
        net::strip_port(self.parse_server_address())
            .trim_end_matches('.')
            .to_ascii_lowercase()
    }

    /// Parses `host///client-ip:port///timestamp[///signature]`.
    pub fn parse_real_ip(&self) -> Result<SocketAddr, CodecError> {
        let addr = self
            .server_address
            .split(FORGE_SEPARATOR)
            .next()
            .unwrap_or_default();
        let parts: Vec<&str> = addr.split(REAL_IP_SEPARATOR).collect();
        if parts.len() < 3 {
            return Err(CodecError::MalformedFrame(
                "real-ip payload needs address, client and timestamp".into(),
            ));
        }
        parts[1]
            .parse::<SocketAddr>()
            .map_err(|e| CodecError::MalformedFrame(format!("real-ip client address: {e}")))
    }

    /// Rewrites the address field to `host///client///unix-ts`, keeping any
    /// Forge suffix after the host.
    pub fn upgrade_to_real_ip(&mut self, client: SocketAddr, unix_ts: u64) {
        let (host, forge) = match self.server_address.split_once(FORGE_SEPARATOR) {
            Some((host, rest)) => (host, Some(rest)),
            None => (self.server_address.as_str(), None),
        };
        let host = host.split(REAL_IP_SEPARATOR).next().unwrap_or_default();
        let mut out = format!("{host}{REAL_IP_SEPARATOR}{client}{REAL_IP_SEPARATOR}{unix_ts}");
        if let Some(forge) = forge {
            out.push(FORGE_SEPARATOR);
            out.push_str(forge);
        }
        self.server_address = out;
    }

    /// Replaces the routed host with `host`, leaving the extensions intact.
    pub fn set_server_address(&mut self, host: &str) {
        let old = self.parse_server_address().to_string();
        if old.is_empty() {
            self.server_address.insert_str(0, host);
            return;
        }
        self.server_address = self.server_address.replacen(&old, host, 1);
    }
}

pub fn status_request() -> Packet {
    Packet::new(STATUS_REQUEST_ID, Vec::new())
}

pub fn decode_status_request(packet: &Packet) -> Result<(), CodecError> {
    expect_id(packet, STATUS_REQUEST_ID)?;
    if !packet.payload.is_empty() {
        return Err(CodecError::MalformedFrame("status request has a payload".into()));
    }
    Ok(())
}

pub fn status_response(json: &str) -> Packet {
    Packet::build(STATUS_RESPONSE_ID, |w| w.write_string(json))
}

pub fn decode_status_response(packet: &Packet) -> Result<String, CodecError> {
    expect_id(packet, STATUS_RESPONSE_ID)?;
    packet.reader().read_string(MAX_STATUS_JSON_CHARS)
}

pub fn ping(payload: i64) -> Packet {
    Packet::build(PING_ID, |w| w.write_i64_be(payload))
}

pub fn decode_ping(packet: &Packet) -> Result<i64, CodecError> {
    expect_id(packet, PING_ID)?;
    packet.reader().read_i64_be()
}

/// Signature data sent by 1.19 and 1.19.1/2 clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    pub timestamp: i64,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
    pub signature: Option<SignatureData>,
    pub uuid: Option<u128>,
}

impl LoginStart {
    pub const PROTOCOL_1_19: i32 = 759;
    pub const PROTOCOL_1_19_1: i32 = 760;
    pub const PROTOCOL_1_19_3: i32 = 761;
    pub const PROTOCOL_1_20_2: i32 = 764;

    pub fn decode(packet: &Packet, protocol_version: i32) -> Result<Self, CodecError> {
        expect_id(packet, LOGIN_START_ID)?;
        let mut r = packet.reader();
        let name = r.read_string(MAX_USERNAME_CHARS)?;
        let mut out = Self {
            name,
            signature: None,
            uuid: None,
        };

        if protocol_version >= Self::PROTOCOL_1_20_2 {
            out.uuid = Some(r.read_uuid()?);
            return Ok(out);
        }

        if (Self::PROTOCOL_1_19..Self::PROTOCOL_1_19_3).contains(&protocol_version)
            && r.read_bool()?
        {
            out.signature = Some(SignatureData {
                timestamp: r.read_i64_be()?,
                public_key: r.read_byte_array(1024)?.to_vec(),
                signature: r.read_byte_array(1024)?.to_vec(),
            });
        }

        if protocol_version >= Self::PROTOCOL_1_19_1 && r.read_bool()? {
            out.uuid = Some(r.read_uuid()?);
        }

        Ok(out)
    }

    pub fn encode(&self, protocol_version: i32) -> Packet {
        Packet::build(LOGIN_START_ID, |w| {
            w.write_string(&self.name);
            if protocol_version >= Self::PROTOCOL_1_20_2 {
                w.write_uuid(self.uuid.unwrap_or_default());
                return;
            }
            if (Self::PROTOCOL_1_19..Self::PROTOCOL_1_19_3).contains(&protocol_version) {
                w.write_bool(self.signature.is_some());
                if let Some(sig) = &self.signature {
                    w.write_i64_be(sig.timestamp);
                    w.write_byte_array(&sig.public_key);
                    w.write_byte_array(&sig.signature);
                }
            }
            if protocol_version >= Self::PROTOCOL_1_19_1 {
                w.write_bool(self.uuid.is_some());
                if let Some(uuid) = self.uuid {
                    w.write_uuid(uuid);
                }
            }
        })
    }
}

/// Login disconnect carrying a chat component.
pub fn login_disconnect(reason_json: &str) -> Packet {
    Packet::build(LOGIN_DISCONNECT_ID, |w| w.write_string(reason_json))
}

pub fn decode_login_disconnect(packet: &Packet) -> Result<String, CodecError> {
    expect_id(packet, LOGIN_DISCONNECT_ID)?;
    packet.reader().read_string(MAX_CHAT_CHARS)
}

/// Wraps plain text as `{"text": ...}`; JSON objects pass through unchanged.
pub fn text_component(msg: &str) -> String {
    let trimmed = msg.trim();
    if trimmed.starts_with('{')
        && serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(trimmed).is_ok()
    {
        return trimmed.to_string();
    }
    serde_json::json!({ "text": msg }).to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPlayers {
    #[serde(default)]
    pub max: i32,
    #[serde(default)]
    pub online: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<PlayerSample>>,
}

/// Server list ping response body. Fields the proxy does not touch
/// (`enforcesSecureChat`, `modinfo`, `forgeData`, ...) are preserved as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusJson {
    #[serde(default)]
    pub version: StatusVersion,
    #[serde(default)]
    pub players: StatusPlayers,
    #[serde(default)]
    pub description: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(addr: &str) -> Handshake {
        Handshake {
            protocol_version: 754,
            server_address: addr.into(),
            server_port: 25565,
            next_state: STATE_LOGIN,
        }
    }

    #[test]
    fn handshake_round_trip() {
        let hs = Handshake {
            protocol_version: 754,
            server_address: "mc.example.com".into(),
            server_port: 25565,
            next_state: STATE_STATUS,
        };
        let p = hs.encode();
        assert_eq!(Handshake::decode(&p).unwrap(), hs);
        assert!(hs.is_status_request());
        assert!(!hs.is_login_request());
    }

    #[test]
    fn handshake_with_wrong_id_is_rejected() {
        let p = Packet::new(0x01, Vec::new());
        assert!(matches!(
            Handshake::decode(&p),
            Err(CodecError::UnexpectedPacketId { expected: 0, got: 1 })
        ));
    }

    #[test]
    fn routing_key_strips_markers_dots_and_port() {
        assert_eq!(handshake("MC.Example.com.").routing_key(), "mc.example.com");
        assert_eq!(
            handshake("mc.example.com\0FML3\0").routing_key(),
            "mc.example.com"
        );
        assert_eq!(
            handshake("mc.example.com///1.2.3.4:5555///1700000000").routing_key(),
            "mc.example.com"
        );
        assert_eq!(handshake("mc.example.com:25565").routing_key(), "mc.example.com");
        assert_eq!(handshake(".mc.example.com.").routing_key(), "mc.example.com");
    }

    #[test]
    fn real_ip_parse_and_upgrade() {
        let hs = handshake("mc.example.com///203.0.113.9:54321///1700000000");
        assert!(hs.is_real_ip_address());
        assert_eq!(
            hs.parse_real_ip().unwrap(),
            "203.0.113.9:54321".parse::<SocketAddr>().unwrap()
        );

        let mut hs = handshake("mc.example.com\0FML2\0");
        hs.upgrade_to_real_ip("198.51.100.1:4000".parse().unwrap(), 1_700_000_000);
        assert_eq!(
            hs.server_address,
            "mc.example.com///198.51.100.1:4000///1700000000\0FML2\0"
        );
        assert!(hs.is_forge_address());
        assert_eq!(hs.routing_key(), "mc.example.com");

        assert!(handshake("mc.example.com").parse_real_ip().is_err());
    }

    #[test]
    fn set_server_address_keeps_extensions() {
        let mut hs = handshake("play.example.com\0FML3\0");
        hs.set_server_address("10.0.0.5");
        assert_eq!(hs.server_address, "10.0.0.5\0FML3\0");
    }

    #[test]
    fn login_start_by_protocol_version() {
        let uuid = 0x069a79f4_44e9_4726_a5be_fca90e38aaf5u128;

        let legacy = LoginStart {
            name: "Notch".into(),
            signature: None,
            uuid: None,
        };
        let p = legacy.encode(754);
        assert_eq!(LoginStart::decode(&p, 754).unwrap(), legacy);

        let signed = LoginStart {
            name: "Notch".into(),
            signature: Some(SignatureData {
                timestamp: 1,
                public_key: vec![1, 2, 3],
                signature: vec![4, 5],
            }),
            uuid: Some(uuid),
        };
        let p = signed.encode(760);
        assert_eq!(LoginStart::decode(&p, 760).unwrap(), signed);

        let optional_uuid = LoginStart {
            name: "Notch".into(),
            signature: None,
            uuid: Some(uuid),
        };
        let p = optional_uuid.encode(763);
        assert_eq!(LoginStart::decode(&p, 763).unwrap(), optional_uuid);

        let p = optional_uuid.encode(765);
        assert_eq!(LoginStart::decode(&p, 765).unwrap(), optional_uuid);
    }

    #[test]
    fn status_json_preserves_unknown_fields() {
        let raw = r#"{"version":{"name":"1.16.5","protocol":754},"players":{"max":20,"online":0},"description":{"text":"hi"},"enforcesSecureChat":true}"#;
        let parsed: StatusJson = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.version.protocol, 754);
        assert_eq!(parsed.extra["enforcesSecureChat"], serde_json::json!(true));
        let back: serde_json::Value = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["enforcesSecureChat"], serde_json::json!(true));
        assert!(back.get("favicon").is_none());
    }

    #[test]
    fn text_component_wraps_plain_text() {
        assert_eq!(text_component("bye \"you\""), r#"{"text":"bye \"you\""}"#);
        assert_eq!(text_component(r#"{"text":"x"}"#), r#"{"text":"x"}"#);
    }

    #[test]
    fn ping_and_status_packets() {
        let p = ping(0xCAFEBABE);
        assert_eq!(decode_ping(&p).unwrap(), 0xCAFEBABE);
        let p = status_response("{}");
        assert_eq!(decode_status_response(&p).unwrap(), "{}");
        assert!(decode_status_request(&status_request()).is_ok());
        let p = login_disconnect(r#"{"text":"x"}"#);
        assert_eq!(decode_login_disconnect(&p).unwrap(), r#"{"text":"x"}"#);
    }
}
