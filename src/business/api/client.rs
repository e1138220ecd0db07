//! HTTP client for the control plane (`/api/1/*`)

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::models::{InjectRequest, KeyInfo, NewKey, Permissions, ProxyStatus, SpawnerStatus};
use crate::config::ClientConfig;
use crate::core::{InjectDirection, ProxyId};
use crate::error::{render_payload, EzProxyError, Result};
use crate::logger::log;
use crate::transport::with_scheme_family;

/// Control-plane API version
const API_VERSION: u32 = 1;

const STATUS_OK: i64 = 200;
const STATUS_UNAUTHORIZED: i64 = 401;
const STATUS_FORBIDDEN: i64 = 403;

/// Wrapper around every control-plane response
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "Data", default)]
    data: serde_json::Value,
}

/// Stateless request helpers over a base URL and API key
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    key: String,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: &ClientConfig) -> Result<Self> {
        // `ws`/`wss` addresses map back to `http`/`https`
        let base = with_scheme_family(&config.base_url, "http", "https")?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base,
            key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Spawner status
    pub async fn status(&self) -> Result<SpawnerStatus> {
        let url = self.endpoint("status", &[], true)?;
        self.get(url).await
    }

    /// Every proxy known to the spawner
    pub async fn list_proxies(&self) -> Result<Vec<ProxyStatus>> {
        let url = self.endpoint("proxies", &[], true)?;
        // No proxies arrives as `null`
        let proxies = self
            .get::<Option<Vec<ProxyStatus>>>(url)
            .await?
            .unwrap_or_default();
        log::debug!(count = proxies.len(), "Proxies fetched");
        Ok(proxies)
    }

    /// One-shot injection. `target` may be `TARGET_ALL`.
    pub async fn inject(
        &self,
        target: ProxyId,
        data: &[u8],
        to_client: bool,
        to_server: bool,
    ) -> Result<()> {
        if InjectDirection::from_flags(to_client, to_server).is_none() {
            return Err(EzProxyError::Argument(
                "to_client and/or to_server must be set".to_string(),
            ));
        }

        let url = self.endpoint("inject", &[], true)?;
        let body = InjectRequest {
            id: target,
            data: data.to_vec(),
            to_client,
            to_server,
        };
        log::debug!(target = target, len = data.len(), to_client, to_server, "Injecting");

        let response = self.http.post(url).json(&body).send().await?;
        let _: serde_json::Value = read_envelope(response).await?;
        Ok(())
    }

    /// Mint a key carrying `permissions` (a subset of the caller's own)
    pub async fn new_key(&self, permissions: Permissions) -> Result<NewKey> {
        let url = self.endpoint("newkey", &[("perms", permissions.bits().to_string())], true)?;
        let key: NewKey = self.get(url).await?;
        log::info!(perms = key.perms, "New API key created");
        Ok(key)
    }

    /// Introspect `key`, or the client's own key when `None`
    pub async fn key_info(&self, key: Option<&str>) -> Result<KeyInfo> {
        let url = match key {
            Some(foreign) => self.endpoint("keyinfo", &[("key", foreign.to_string())], false)?,
            None => self.endpoint("keyinfo", &[], true)?,
        };
        self.get(url).await
    }

    /// `/api/1/<name>?<params>[&key=<api key>]`
    fn endpoint(&self, name: &str, params: &[(&str, String)], with_key: bool) -> Result<Url> {
        let path = format!(
            "{}/api/{}/{}",
            self.base.path().trim_end_matches('/'),
            API_VERSION,
            name
        );
        let mut url = self.base.clone();
        url.set_path(&path);
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in params {
                query.append_pair(k, v);
            }
            if with_key {
                query.append_pair("key", &self.key);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.http.get(url).send().await?;
        read_envelope(response).await
    }
}

async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status().as_u16();
    let body = response.text().await?;
    interpret_envelope(status, &body)
}

/// Map an HTTP status and body onto the typed payload or the error taxonomy
pub(crate) fn interpret_envelope<T: DeserializeOwned>(http_status: u16, body: &str) -> Result<T> {
    if !(200..300).contains(&http_status) {
        return Err(EzProxyError::Remote {
            status: i64::from(http_status),
            payload: body.trim().to_string(),
        });
    }

    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| EzProxyError::Protocol(format!("malformed response envelope: {}", e)))?;

    match envelope.status {
        STATUS_OK => serde_json::from_value(envelope.data)
            .map_err(|e| EzProxyError::Protocol(format!("unexpected response data: {}", e))),
        STATUS_UNAUTHORIZED => Err(EzProxyError::Auth(render_payload(&envelope.data))),
        STATUS_FORBIDDEN => Err(EzProxyError::Permission(render_payload(&envelope.data))),
        status => Err(EzProxyError::Remote {
            status,
            payload: render_payload(&envelope.data),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(base: &str) -> ApiClient {
        let config = ClientConfig::new(base, "BABE").with_request_timeout(Duration::from_secs(1));
        ApiClient::new(&config).unwrap()
    }

    #[test]
    fn test_endpoint_appends_key() {
        let c = client("http://10.0.0.46:8080");
        let url = c.endpoint("status", &[], true).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.46:8080/api/1/status?key=BABE");

        let url = c
            .endpoint("newkey", &[("perms", "24".to_string())], true)
            .unwrap();
        assert_eq!(url.query(), Some("perms=24&key=BABE"));
    }

    #[test]
    fn test_endpoint_without_key() {
        let c = client("http://h/base/");
        let url = c
            .endpoint("keyinfo", &[("key", "CAFE".to_string())], false)
            .unwrap();
        assert_eq!(url.as_str(), "http://h/base/api/1/keyinfo?key=CAFE");

        let url = c.endpoint("status", &[], false).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_ws_base_maps_to_http() {
        assert_eq!(client("ws://h:1").base_url().scheme(), "http");
        assert_eq!(client("wss://h").base_url().scheme(), "https");
        let config = ClientConfig::new("gopher://h", "k");
        assert!(matches!(
            ApiClient::new(&config),
            Err(EzProxyError::Argument(_))
        ));
    }

    #[test]
    fn test_envelope_unauthorized() {
        let err = interpret_envelope::<KeyInfo>(200, r#"{"Status":401,"Data":"bad key"}"#)
            .unwrap_err();
        match err {
            EzProxyError::Auth(msg) => assert!(msg.contains("bad key")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_envelope_key_info() {
        let body = r#"{"Status":200,"Data":{"Value":24,"CanCheckStatus":false,"CanClose":false,
            "CanUseWebsocket":true,"CanFilter":true,"CanInject":true,"CanMakeKeys":false,
            "CanDuplicateKeys":false,"Admin":false}}"#;
        let info: KeyInfo = interpret_envelope(200, body).unwrap();
        assert_eq!(info.value, 24);
        assert!(info.can_filter);
        assert!(info.can_inject);
        assert!(info.can_use_websocket);
        assert!(!info.admin);
        assert!(info.permissions().contains(Permissions::FILTER));
    }

    #[test]
    fn test_envelope_forbidden() {
        let err = interpret_envelope::<NewKey>(
            200,
            r#"{"Status":403,"Data":"lacking permission to add 'CanClose' permission"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EzProxyError::Permission(ref m) if m.contains("CanClose")));
    }

    #[test]
    fn test_envelope_other_status() {
        let err = interpret_envelope::<serde_json::Value>(
            200,
            r#"{"Status":404,"Data":"proxy not found: no such proxy"}"#,
        )
        .unwrap_err();
        match err {
            EzProxyError::Remote { status, payload } => {
                assert_eq!(status, 404);
                assert!(payload.contains("proxy not found"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transport_status_is_remote_error() {
        let err = interpret_envelope::<serde_json::Value>(405, "Method must be GET").unwrap_err();
        assert!(matches!(
            err,
            EzProxyError::Remote { status: 405, ref payload } if payload == "Method must be GET"
        ));
    }

    #[test]
    fn test_envelope_malformed() {
        assert!(matches!(
            interpret_envelope::<KeyInfo>(200, "<html>"),
            Err(EzProxyError::Protocol(_))
        ));
        assert!(matches!(
            interpret_envelope::<KeyInfo>(200, r#"{"Status":200,"Data":"nope"}"#),
            Err(EzProxyError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_inject_requires_direction() {
        // Port 9 (discard) is never contacted: validation happens first
        let c = client("http://127.0.0.1:9");
        let err = c.inject(1, b"data", false, false).await.unwrap_err();
        assert!(matches!(err, EzProxyError::Argument(_)));
    }
}
