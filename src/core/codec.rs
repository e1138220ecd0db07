//! Wire codec for the control channel
//!
//! Outbound (client -> service):
//! `{"Type": 1|2|3, "Target": int, "Data": base64, "Extra": int}`
//!
//! Inbound (service -> client):
//! `{"Status": int, "Data": {"Type": int, "Data": {...}} | <error payload>}`

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::packet::Packet;
use crate::error::{EzProxyError, Result};

pub const STATUS_OK: i64 = 200;
/// Soft timeout reported by the service, the receive loop keeps going
pub const STATUS_TIMEOUT: i64 = 408;

const SERVER_TYPE_ERROR: i64 = -1;
const SERVER_TYPE_PACKET: i64 = 1;

/// Filter `Extra` bit: set = allow, clear = drop
const FILTER_ALLOW: u32 = 1 << 0;

/// Outbound control message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ControlKind {
    Inject = 1,
    Close = 2,
    Filter = 3,
}

impl From<ControlKind> for i64 {
    fn from(kind: ControlKind) -> i64 {
        kind as i64
    }
}

impl TryFrom<i64> for ControlKind {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlKind::Inject),
            2 => Ok(ControlKind::Close),
            3 => Ok(ControlKind::Filter),
            other => Err(format!("unknown control message type {}", other)),
        }
    }
}

/// Injection direction bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectDirection {
    ToClient = 1,
    ToServer = 2,
    Both = 3,
}

impl InjectDirection {
    pub fn bits(self) -> u32 {
        self as u32
    }

    /// `None` when neither direction is selected
    pub fn from_flags(to_client: bool, to_server: bool) -> Option<Self> {
        match (to_client, to_server) {
            (true, true) => Some(InjectDirection::Both),
            (true, false) => Some(InjectDirection::ToClient),
            (false, true) => Some(InjectDirection::ToServer),
            (false, false) => None,
        }
    }
}

/// Client -> service message
///
/// `target` is a proxy id for `Inject`/`Close` and a packet sequence number
/// for `Filter`; `extra` is the direction bitmask for `Inject` and the verdict
/// bit for `Filter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "Type")]
    pub kind: ControlKind,
    #[serde(rename = "Target")]
    pub target: i64,
    #[serde(rename = "Data", with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "Extra")]
    pub extra: u32,
}

impl ControlMessage {
    pub fn filter(pkt_num: i64, allow: bool) -> Self {
        Self {
            kind: ControlKind::Filter,
            target: pkt_num,
            data: Vec::new(),
            extra: if allow { FILTER_ALLOW } else { 0 },
        }
    }

    pub fn inject(target: i64, data: Vec<u8>, direction: InjectDirection) -> Self {
        Self {
            kind: ControlKind::Inject,
            target,
            data,
            extra: direction.bits(),
        }
    }

    pub fn close(target: i64) -> Self {
        Self {
            kind: ControlKind::Close,
            target,
            data: Vec::new(),
            extra: 0,
        }
    }

    /// Verdict carried by a `Filter` message
    pub fn allows(&self) -> bool {
        self.extra & FILTER_ALLOW != 0
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EzProxyError::Protocol(format!("malformed control message: {}", e)))
    }
}

/// Service -> client message
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Status 200 carrying a packet
    Packet(Packet),
    /// Any non-200 status with its error payload
    Failure { status: i64, payload: Value },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "Data", default)]
    data: Value,
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "Type")]
    kind: i64,
    #[serde(rename = "Data", default)]
    data: Value,
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| EzProxyError::Protocol(format!("malformed JSON: {}", e)))?;

        if envelope.status != STATUS_OK {
            return Ok(ServerMessage::Failure {
                status: envelope.status,
                payload: envelope.data,
            });
        }

        let tagged: Tagged = serde_json::from_value(envelope.data)
            .map_err(|e| EzProxyError::Protocol(format!("malformed message body: {}", e)))?;

        match tagged.kind {
            SERVER_TYPE_PACKET => {
                let packet = serde_json::from_value(tagged.data)
                    .map_err(|e| EzProxyError::Protocol(format!("malformed packet: {}", e)))?;
                Ok(ServerMessage::Packet(packet))
            }
            SERVER_TYPE_ERROR => Err(EzProxyError::Protocol(
                "received error sentinel message type -1".to_string(),
            )),
            other => Err(EzProxyError::Protocol(format!(
                "unknown message type {}",
                other
            ))),
        }
    }

    /// Encode in the service's wire shape. A `Failure` must carry a non-200 status.
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            ServerMessage::Packet(packet) => json!({
                "Status": STATUS_OK,
                "Data": { "Type": SERVER_TYPE_PACKET, "Data": packet },
            }),
            ServerMessage::Failure { status, .. } if *status == STATUS_OK => {
                return Err(EzProxyError::Argument(
                    "failure message cannot carry status 200".to_string(),
                ));
            }
            ServerMessage::Failure { status, payload } => json!({
                "Status": status,
                "Data": payload,
            }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Standard base64 with padding for `[]byte` fields; JSON `null` decodes as empty
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::CapFlags;

    fn sample_packet(data: Vec<u8>) -> Packet {
        Packet {
            pkt_num: 42,
            network: "tcp".to_string(),
            source: "127.0.0.1:5000".to_string(),
            proxy_id: 7,
            dest: "127.0.0.1:6000".to_string(),
            data,
            flags: CapFlags::TO_SERVER,
        }
    }

    #[test]
    fn test_filter_message_wire_shape() {
        let text = ControlMessage::filter(9, true).encode().unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["Type"], 3);
        assert_eq!(v["Target"], 9);
        assert_eq!(v["Data"], "");
        assert_eq!(v["Extra"], 1);

        let drop = ControlMessage::filter(9, false);
        assert_eq!(drop.extra, 0);
        assert!(!drop.allows());
    }

    #[test]
    fn test_inject_and_close_wire_shape() {
        let v: Value = serde_json::from_str(
            &ControlMessage::inject(-1, b"hi".to_vec(), InjectDirection::Both)
                .encode()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(v["Type"], 1);
        assert_eq!(v["Target"], -1);
        assert_eq!(v["Data"], "aGk=");
        assert_eq!(v["Extra"], 3);

        let v: Value =
            serde_json::from_str(&ControlMessage::close(4).encode().unwrap()).unwrap();
        assert_eq!(v["Type"], 2);
        assert_eq!(v["Target"], 4);
    }

    #[test]
    fn test_control_message_round_trip_binary_payloads() {
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0xff, 0xfe, 0x00, 0x80],
            (0..=255u8).collect(),
        ];
        for payload in payloads {
            let msg = ControlMessage::inject(3, payload, InjectDirection::ToServer);
            let decoded = ControlMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_server_message_round_trip() {
        let msg = ServerMessage::Packet(sample_packet(vec![0xc3, 0x28, 0x00]));
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);

        let failure = ServerMessage::Failure {
            status: 404,
            payload: json!("proxy not found"),
        };
        assert_eq!(
            ServerMessage::decode(&failure.encode().unwrap()).unwrap(),
            failure
        );
    }

    #[test]
    fn test_failure_with_ok_status_is_rejected() {
        let bad = ServerMessage::Failure {
            status: 200,
            payload: Value::Null,
        };
        assert!(matches!(bad.encode(), Err(EzProxyError::Argument(_))));
    }

    #[test]
    fn test_decode_packet_from_service_json() {
        let text = r#"{"Status":200,"Data":{"Type":1,"Data":{"PktNum":-1,"ProxyId":2,"Network":"udp","Source":"a:1","Dest":"b:2","Data":"AAE=","Flags":2}}}"#;
        match ServerMessage::decode(text).unwrap() {
            ServerMessage::Packet(p) => {
                assert_eq!(p.pkt_num, -1);
                assert_eq!(p.proxy_id, 2);
                assert_eq!(p.network, "udp");
                assert_eq!(p.data, vec![0, 1]);
                assert!(p.is_injected());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_null_data_as_empty() {
        let text = r#"{"Status":200,"Data":{"Type":1,"Data":{"PktNum":1,"ProxyId":2,"Network":"tcp","Source":"a:1","Dest":"b:2","Data":null,"Flags":0}}}"#;
        match ServerMessage::decode(text).unwrap() {
            ServerMessage::Packet(p) => assert!(p.data.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_timeout_status() {
        let text = r#"{"Status":408,"Data":"packet timed out"}"#;
        assert_eq!(
            ServerMessage::decode(text).unwrap(),
            ServerMessage::Failure {
                status: 408,
                payload: json!("packet timed out")
            }
        );
    }

    #[test]
    fn test_decode_unknown_type_is_protocol_error() {
        let text = r#"{"Status":200,"Data":{"Type":99,"Data":{}}}"#;
        let err = ServerMessage::decode(text).unwrap_err();
        assert!(matches!(err, EzProxyError::Protocol(ref m) if m.contains("99")));
    }

    #[test]
    fn test_decode_error_sentinel_is_protocol_error() {
        let text = r#"{"Status":200,"Data":{"Type":-1,"Data":null}}"#;
        assert!(matches!(
            ServerMessage::decode(text),
            Err(EzProxyError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(
            ServerMessage::decode("{not json"),
            Err(EzProxyError::Protocol(_))
        ));
        assert!(matches!(
            ServerMessage::decode(r#"{"Status":200,"Data":{"Type":1,"Data":{"PktNum":1}}}"#),
            Err(EzProxyError::Protocol(_))
        ));
    }

    #[test]
    fn test_control_kind_rejects_unknown() {
        assert!(ControlMessage::decode(r#"{"Type":7,"Target":0,"Data":"","Extra":0}"#).is_err());
    }

    #[test]
    fn test_inject_direction_from_flags() {
        assert_eq!(InjectDirection::from_flags(true, false), Some(InjectDirection::ToClient));
        assert_eq!(InjectDirection::from_flags(false, true), Some(InjectDirection::ToServer));
        assert_eq!(InjectDirection::from_flags(true, true), Some(InjectDirection::Both));
        assert_eq!(InjectDirection::from_flags(false, false), None);
        assert_eq!(InjectDirection::Both.bits(), 3);
    }
}
