//! Captured packet model

use serde::{Deserialize, Serialize};

use super::codec::base64_bytes;

/// Proxy identifier assigned by the spawner
pub type ProxyId = i64;

/// Target value addressing every proxy
pub const TARGET_ALL: ProxyId = -1;

/// Capture flags carried on every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapFlags(pub u32);

impl CapFlags {
    /// Set when the payload travels client -> server
    pub const TO_SERVER: CapFlags = CapFlags(1 << 0);
    /// Set when the packet was injected rather than captured
    pub const INJECTED: CapFlags = CapFlags(1 << 1);

    pub fn contains(self, other: CapFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_server_bound(self) -> bool {
        self.contains(Self::TO_SERVER)
    }

    pub fn is_client_bound(self) -> bool {
        !self.is_server_bound()
    }

    pub fn is_injected(self) -> bool {
        self.contains(Self::INJECTED)
    }
}

impl std::ops::BitOr for CapFlags {
    type Output = CapFlags;

    fn bitor(self, rhs: CapFlags) -> CapFlags {
        CapFlags(self.0 | rhs.0)
    }
}

/// A packet delivered over the control channel
///
/// `pkt_num` is the per-channel sequence number used for filter verdicts.
/// The service reports `-1` when the packet is not awaiting a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Packet {
    pub pkt_num: i64,
    pub network: String,
    pub source: String,
    pub proxy_id: ProxyId,
    pub dest: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub flags: CapFlags,
}

impl Packet {
    pub fn is_server_bound(&self) -> bool {
        self.flags.is_server_bound()
    }

    pub fn is_injected(&self) -> bool {
        self.flags.is_injected()
    }

    /// Address of the intercepted client
    pub fn client(&self) -> &str {
        if self.is_server_bound() {
            &self.source
        } else {
            &self.dest
        }
    }

    /// Address of the intercepted server
    pub fn server(&self) -> &str {
        if self.is_server_bound() {
            &self.dest
        } else {
            &self.source
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.network == "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(flags: CapFlags) -> Packet {
        Packet {
            pkt_num: 3,
            network: "tcp".to_string(),
            source: "10.0.0.1:4000".to_string(),
            proxy_id: 1,
            dest: "10.0.0.2:80".to_string(),
            data: vec![1, 2, 3],
            flags,
        }
    }

    #[test]
    fn test_cap_flags() {
        assert!(CapFlags(0).is_client_bound());
        assert!(CapFlags(1).is_server_bound());
        assert!(!CapFlags(1).is_injected());
        assert!(CapFlags(2).is_injected());
        assert!((CapFlags::TO_SERVER | CapFlags::INJECTED).is_injected());
        assert_eq!((CapFlags::TO_SERVER | CapFlags::INJECTED).0, 3);
    }

    #[test]
    fn test_client_bound_roles() {
        let p = packet(CapFlags(0));
        assert_eq!(p.server(), p.source);
        assert_eq!(p.client(), p.dest);
    }

    #[test]
    fn test_server_bound_roles() {
        let p = packet(CapFlags::TO_SERVER);
        assert_eq!(p.client(), p.source);
        assert_eq!(p.server(), p.dest);
    }

    #[test]
    fn test_roles_ignore_injected_bit() {
        for bits in 0..8u32 {
            let p = packet(CapFlags(bits));
            if bits & 1 == 1 {
                assert_eq!(p.client(), "10.0.0.1:4000");
                assert_eq!(p.server(), "10.0.0.2:80");
            } else {
                assert_eq!(p.server(), "10.0.0.1:4000");
                assert_eq!(p.client(), "10.0.0.2:80");
            }
        }
    }

    #[test]
    fn test_packet_wire_names() {
        let json = serde_json::to_value(packet(CapFlags::INJECTED)).unwrap();
        assert_eq!(json["PktNum"], 3);
        assert_eq!(json["ProxyId"], 1);
        assert_eq!(json["Data"], "AQID");
        assert_eq!(json["Flags"], 2);
        assert_eq!(json["Dest"], "10.0.0.2:80");
    }
}
