//! Control-plane response records

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::codec::base64_bytes;
use crate::core::ProxyId;

/// Aggregate spawner status, `GET /api/1/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpawnerStatus {
    pub connection_count: u64,
    pub alive: bool,
    pub bytes_sent: u64,
    /// Multiplexer name -> proxy address
    #[serde(default, deserialize_with = "null_as_default")]
    pub mpx_addresses: HashMap<String, String>,
    pub server_address: String,
}

/// The service encodes empty collections as `null`
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One proxy, `GET /api/1/proxies`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyStatus {
    pub id: ProxyId,
    pub alive: bool,
    pub address: String,
    pub network: String,
    pub bytes_sent: u64,
    /// Milliseconds since the proxy last saw traffic
    pub last_contact_ago: i64,
}

impl ProxyStatus {
    pub fn last_contact(&self) -> Duration {
        Duration::from_millis(self.last_contact_ago.max(0) as u64)
    }
}

/// Permission bitfield attached to an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub u64);

impl Permissions {
    pub const CHECK_STATUS: Permissions = Permissions(1 << 0);
    pub const CLOSE: Permissions = Permissions(1 << 1);
    pub const USE_WEBSOCKET: Permissions = Permissions(1 << 2);
    pub const FILTER: Permissions = Permissions(1 << 3);
    pub const INJECT: Permissions = Permissions(1 << 4);
    pub const MAKE_KEYS: Permissions = Permissions(1 << 5);
    pub const DUPLICATE_KEYS: Permissions = Permissions(1 << 6);
    pub const ALL: Permissions = Permissions(0x0fff_ffff_ffff_ffff);

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

/// Key introspection, `GET /api/1/keyinfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyInfo {
    pub value: u64,
    pub can_check_status: bool,
    pub can_close: bool,
    pub can_use_websocket: bool,
    pub can_filter: bool,
    pub can_inject: bool,
    pub can_make_keys: bool,
    pub can_duplicate_keys: bool,
    pub admin: bool,
}

impl KeyInfo {
    pub fn permissions(&self) -> Permissions {
        Permissions(self.value)
    }
}

/// Freshly minted key, `GET /api/1/newkey`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewKey {
    /// Hex-encoded key
    pub key: String,
    pub perms: u64,
}

/// Body of `POST /api/1/inject`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InjectRequest {
    pub id: ProxyId,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub to_client: bool,
    pub to_server: bool,
}
