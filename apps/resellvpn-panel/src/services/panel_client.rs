//! Authenticated façade over the external VPN panel. One session cookie per
//! server, cached on the Server row and refreshed lazily by inspecting the
//! cookie's own Expires attribute.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::RwLock;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use resellvpn_db::models::Server;
use resellvpn_db::repositories::{ClientStatRepository, ServerRepository};

use crate::error::{CoreError, CoreResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
// Refresh slightly early so an in-flight call never rides an expiring cookie.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Supported panel verbs. A closed set instead of stringly dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct PanelCredentials {
    pub username: String,
    pub password: String,
}

/// Raw client record as listed by the panel, before local filtering.
#[derive(Debug, Clone)]
pub struct PanelStat {
    pub id: String,
    pub inbound_id: i32,
    pub email: String,
    pub sub_id: String,
    pub tg_id: Option<String>,
    pub flow: Option<String>,
    pub total: i64,
    pub up: i64,
    pub down: i64,
    pub expiry_time: i64,
    pub enable: bool,
    pub limit_ip: i32,
}

/// One credential to provision.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub id: Uuid,
    pub email: String,
    pub sub_id: String,
    pub total_bytes: i64,
    pub expiry_time: i64,
    pub limit_ip: i32,
}

/// Fields replaced on an existing credential; everything unset is carried
/// over from the local mirror because the panel wants the full object back.
#[derive(Debug, Clone, Default)]
pub struct PartialClientSpec {
    pub total_bytes: Option<i64>,
    pub expiry_time: Option<i64>,
    pub enable: Option<bool>,
    pub limit_ip: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerHealth {
    pub cpu: f64,
    pub mem: ResourceUsage,
    pub disk: ResourceUsage,
    pub loads: Vec<f64>,
    #[serde(rename = "netTraffic")]
    pub net_traffic: NetTraffic,
    pub uptime: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceUsage {
    pub current: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetTraffic {
    pub sent: f64,
    pub recv: f64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    msg: String,
    obj: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InboundRecord {
    id: i32,
    #[serde(rename = "clientStats", default)]
    client_stats: Vec<TrafficRecord>,
    #[serde(default)]
    settings: String,
}

#[derive(Debug, Deserialize)]
struct TrafficRecord {
    email: String,
    up: i64,
    down: i64,
    total: i64,
    #[serde(rename = "expiryTime")]
    expiry_time: i64,
    enable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientSettings {
    #[serde(default)]
    clients: Vec<ClientRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientRecord {
    id: String,
    email: String,
    #[serde(default)]
    flow: String,
    #[serde(rename = "limitIp", default)]
    limit_ip: i32,
    #[serde(rename = "totalGB", default)]
    total_gb: i64,
    #[serde(rename = "expiryTime", default)]
    expiry_time: i64,
    #[serde(default = "default_enable")]
    enable: bool,
    #[serde(rename = "tgId", default)]
    tg_id: String,
    #[serde(rename = "subId", default)]
    sub_id: String,
}

fn default_enable() -> bool {
    true
}

/// Per-process cookie cache keyed by server id. Callers usually carry a
/// `Server` snapshot loaded at the start of a tick; once a login refreshes
/// the cookie, that snapshot's token is stale for the rest of the tick and
/// only this cache has the current one.
#[derive(Clone, Default)]
struct SessionCache {
    inner: Arc<RwLock<HashMap<i64, String>>>,
}

impl SessionCache {
    async fn get_fresh(&self, server_id: i64, now: DateTime<Utc>) -> Option<String> {
        let map = self.inner.read().await;
        map.get(&server_id)
            .filter(|cookie| cookie_is_fresh(cookie, now))
            .cloned()
    }

    async fn store(&self, server_id: i64, cookie: &str) {
        self.inner.write().await.insert(server_id, cookie.to_string());
    }
}

#[derive(Clone)]
pub struct PanelClient {
    http: Client,
    creds: PanelCredentials,
    server_repo: ServerRepository,
    stat_repo: ClientStatRepository,
    sessions: SessionCache,
}

impl PanelClient {
    pub fn new(
        creds: PanelCredentials,
        server_repo: ServerRepository,
        stat_repo: ClientStatRepository,
    ) -> Self {
        Self {
            http: Client::new(),
            creds,
            server_repo,
            stat_repo,
            sessions: SessionCache::default(),
        }
    }

    /// Cached session cookie, refreshed when its Expires attribute has
    /// passed. The in-process cache is consulted before the caller's Server
    /// snapshot, so one login per expiry serves every later call in the
    /// tick. Concurrent refreshes may race; last write wins and either
    /// cookie is valid.
    pub async fn authorize(&self, server: &Server) -> CoreResult<String> {
        let now = Utc::now();
        if let Some(cookie) = self.sessions.get_fresh(server.id, now).await {
            return Ok(cookie);
        }
        if let Some(token) = &server.token {
            if cookie_is_fresh(token, now) {
                self.sessions.store(server.id, token).await;
                return Ok(token.clone());
            }
        }
        self.login(server).await
    }

    async fn login(&self, server: &Server) -> CoreResult<String> {
        let url = format!("{}/login", server.base_url());
        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .form(&[
                ("username", self.creds.username.as_str()),
                ("password", self.creds.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CoreError::PanelRequest {
                server_id: server.id,
                status: e.status().map(|s| s.as_u16()),
            })?;

        let cookie = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|raw| raw.to_ascii_lowercase().contains("session"))
            .map(str::to_string);

        let Some(cookie) = cookie else {
            return Err(CoreError::PanelAuth {
                server_id: server.id,
            });
        };

        self.sessions.store(server.id, &cookie).await;
        self.server_repo
            .update_token(server.id, &cookie)
            .await
            .map_err(CoreError::Internal)?;

        info!(server_id = server.id, "panel session refreshed");
        Ok(cookie)
    }

    /// Session-wrapped call returning the panel's `obj` payload.
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        server: &Server,
        endpoint: &str,
        verb: Verb,
        body: Option<serde_json::Value>,
    ) -> CoreResult<Envelope<T>> {
        let token = self.authorize(server).await?;
        let url = format!("{}{}", server.base_url(), endpoint);

        let builder = match verb {
            Verb::Get => self.http.get(&url),
            Verb::Post => {
                let b = self.http.post(&url);
                match body {
                    Some(body) => b.json(&body),
                    None => b,
                }
            }
        };

        let response = builder
            .timeout(REQUEST_TIMEOUT)
            .header(reqwest::header::COOKIE, cookie_pair(&token))
            .send()
            .await
            .map_err(|e| CoreError::PanelRequest {
                server_id: server.id,
                status: e.status().map(|s| s.as_u16()),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::PanelRequest {
                server_id: server.id,
                status: Some(response.status().as_u16()),
            });
        }

        response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| CoreError::PackageProvision(anyhow!("malformed panel response: {}", e)))
    }

    /// Non-idempotent: a duplicate id may error or silently duplicate on the
    /// panel side, so callers must never retry this blindly.
    pub async fn add_client(&self, server: &Server, spec: &ClientSpec) -> CoreResult<()> {
        let settings = ClientSettings {
            clients: vec![ClientRecord {
                id: spec.id.to_string(),
                email: spec.email.clone(),
                flow: String::new(),
                limit_ip: spec.limit_ip,
                total_gb: spec.total_bytes,
                expiry_time: spec.expiry_time,
                enable: true,
                tg_id: String::new(),
                sub_id: spec.sub_id.clone(),
            }],
        };
        let body = json!({
            "id": server.inbound_id,
            "settings": serde_json::to_string(&settings)
                .map_err(|e| CoreError::Internal(e.into()))?,
        });

        let envelope: Envelope<serde_json::Value> = self
            .request(server, "/panel/api/inbounds/addClient", Verb::Post, Some(body))
            .await?;
        if !envelope.success {
            return Err(CoreError::PanelAddClient(envelope.msg));
        }
        Ok(())
    }

    /// The panel replaces the whole client object on update, so the partial
    /// spec is merged over the locally mirrored stat (flow/email/subId/tgId
    /// preserved) before pushing.
    pub async fn update_client(
        &self,
        server: &Server,
        client_id: Uuid,
        partial: &PartialClientSpec,
    ) -> CoreResult<()> {
        let stat = self
            .stat_repo
            .get_by_id(client_id)
            .await
            .map_err(CoreError::Internal)?
            .ok_or(CoreError::NotFound("client stat"))?;

        let settings = ClientSettings {
            clients: vec![ClientRecord {
                id: client_id.to_string(),
                email: stat.email.clone(),
                flow: stat.flow.clone().unwrap_or_default(),
                limit_ip: partial.limit_ip.unwrap_or(stat.limit_ip),
                total_gb: partial.total_bytes.unwrap_or(stat.total),
                expiry_time: partial.expiry_time.unwrap_or(stat.expiry_time),
                enable: partial.enable.unwrap_or(stat.enable),
                tg_id: stat.tg_id.clone().unwrap_or_default(),
                sub_id: stat.sub_id.clone(),
            }],
        };
        let body = json!({
            "id": server.inbound_id,
            "settings": serde_json::to_string(&settings)
                .map_err(|e| CoreError::Internal(e.into()))?,
        });

        let endpoint = format!("/panel/api/inbounds/updateClient/{}", client_id);
        let envelope: Envelope<serde_json::Value> =
            self.request(server, &endpoint, Verb::Post, Some(body)).await?;
        if !envelope.success {
            return Err(CoreError::PanelUpdateClient(envelope.msg));
        }
        Ok(())
    }

    pub async fn delete_client(&self, server: &Server, client_id: Uuid) -> CoreResult<()> {
        let endpoint = format!(
            "/panel/api/inbounds/{}/delClient/{}",
            server.inbound_id, client_id
        );
        let envelope: Envelope<serde_json::Value> =
            self.request(server, &endpoint, Verb::Post, None).await?;
        if !envelope.success {
            return Err(CoreError::PanelUpdateClient(envelope.msg));
        }
        Ok(())
    }

    pub async fn reset_client_traffic(&self, server: &Server, client_id: Uuid) -> CoreResult<()> {
        let stat = self
            .stat_repo
            .get_by_id(client_id)
            .await
            .map_err(CoreError::Internal)?
            .ok_or(CoreError::NotFound("client stat"))?;

        let endpoint = format!(
            "/panel/api/inbounds/{}/resetClientTraffic/{}",
            server.inbound_id, stat.email
        );
        let envelope: Envelope<serde_json::Value> =
            self.request(server, &endpoint, Verb::Post, None).await?;
        if !envelope.success {
            return Err(CoreError::PanelUpdateClient(envelope.msg));
        }
        Ok(())
    }

    pub async fn toggle_client(
        &self,
        server: &Server,
        client_id: Uuid,
        enabled: bool,
    ) -> CoreResult<()> {
        self.update_client(
            server,
            client_id,
            &PartialClientSpec {
                enable: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Full client listing across the server's inbounds, traffic counters
    /// joined with the client settings by email.
    pub async fn list_client_stats(&self, server: &Server) -> CoreResult<Vec<PanelStat>> {
        let envelope: Envelope<Vec<InboundRecord>> = self
            .request(server, "/panel/api/inbounds/list", Verb::Get, None)
            .await?;
        let inbounds = envelope.obj.unwrap_or_default();

        let mut stats = Vec::new();
        for inbound in inbounds {
            let settings: ClientSettings =
                serde_json::from_str(&inbound.settings).unwrap_or(ClientSettings { clients: vec![] });
            for client in settings.clients {
                let traffic = inbound
                    .client_stats
                    .iter()
                    .find(|t| t.email == client.email);
                stats.push(PanelStat {
                    id: client.id,
                    inbound_id: inbound.id,
                    email: client.email,
                    sub_id: client.sub_id,
                    tg_id: (!client.tg_id.is_empty()).then_some(client.tg_id),
                    flow: (!client.flow.is_empty()).then_some(client.flow),
                    total: traffic.map(|t| t.total).unwrap_or(client.total_gb),
                    up: traffic.map(|t| t.up).unwrap_or(0),
                    down: traffic.map(|t| t.down).unwrap_or(0),
                    expiry_time: traffic.map(|t| t.expiry_time).unwrap_or(client.expiry_time),
                    enable: traffic.map(|t| t.enable).unwrap_or(client.enable),
                    limit_ip: client.limit_ip,
                });
            }
        }
        debug!(server_id = server.id, count = stats.len(), "listed panel clients");
        Ok(stats)
    }

    /// Emails of clients with a live connection right now.
    pub async fn list_online_client_ids(&self, server: &Server) -> CoreResult<Vec<String>> {
        let envelope: Envelope<Vec<String>> = self
            .request(server, "/panel/api/inbounds/onlines", Verb::Post, None)
            .await?;
        Ok(envelope.obj.unwrap_or_default())
    }

    pub async fn get_server_health(&self, server: &Server) -> CoreResult<ServerHealth> {
        let envelope: Envelope<ServerHealth> =
            self.request(server, "/server/status", Verb::Get, None).await?;
        envelope.obj.ok_or(CoreError::PanelRequest {
            server_id: server.id,
            status: None,
        })
    }

    /// Remote-side purge of panel-depleted entries; distinct from local
    /// finishing.
    pub async fn del_depleted_clients(&self, server: &Server) -> CoreResult<()> {
        let endpoint = format!(
            "/panel/api/inbounds/delDepletedClients/{}",
            server.inbound_id
        );
        let envelope: Envelope<serde_json::Value> =
            self.request(server, &endpoint, Verb::Post, None).await?;
        if !envelope.success {
            return Err(CoreError::PanelUpdateClient(envelope.msg));
        }
        Ok(())
    }

    /// Binary DB snapshot for the backup job.
    pub async fn get_db(&self, server: &Server) -> CoreResult<Vec<u8>> {
        let token = self.authorize(server).await?;
        let url = format!("{}/server/getDb", server.base_url());
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .header(reqwest::header::COOKIE, cookie_pair(&token))
            .send()
            .await
            .map_err(|e| CoreError::PanelRequest {
                server_id: server.id,
                status: e.status().map(|s| s.as_u16()),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::PanelRequest {
                server_id: server.id,
                status: Some(response.status().as_u16()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| CoreError::PanelRequest {
            server_id: server.id,
            status: e.status().map(|s| s.as_u16()),
        })?;
        Ok(bytes.to_vec())
    }
}

/// `name=value` part of a raw Set-Cookie string.
fn cookie_pair(raw: &str) -> String {
    raw.split(';').next().unwrap_or(raw).trim().to_string()
}

/// Reads the cookie's own Expires attribute instead of a stored timestamp
/// column, mirroring real session semantics. A cookie without one is treated
/// as stale so it gets refreshed.
fn cookie_expiry(raw: &str) -> Option<DateTime<Utc>> {
    for attr in raw.split(';') {
        let attr = attr.trim();
        if let Some(value) = attr
            .strip_prefix("Expires=")
            .or_else(|| attr.strip_prefix("expires="))
        {
            return DateTime::parse_from_rfc2822(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    None
}

fn cookie_is_fresh(raw: &str, now: DateTime<Utc>) -> bool {
    match cookie_expiry(raw) {
        Some(expiry) => expiry > now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const COOKIE: &str =
        "session=abc123; Path=/; Expires=Mon, 02 Jan 2040 08:00:00 GMT; HttpOnly";

    #[test]
    fn cookie_pair_strips_attributes() {
        assert_eq!(cookie_pair(COOKIE), "session=abc123");
        assert_eq!(cookie_pair("session=xyz"), "session=xyz");
    }

    #[test]
    fn parses_expires_attribute() {
        let expiry = cookie_expiry(COOKIE).unwrap();
        assert_eq!(expiry, Utc.with_ymd_and_hms(2040, 1, 2, 8, 0, 0).unwrap());
    }

    #[test]
    fn future_cookie_is_fresh_past_cookie_is_not() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        assert!(cookie_is_fresh(COOKIE, now));

        let expired = "session=old; Expires=Tue, 01 Jan 2019 00:00:00 GMT";
        assert!(!cookie_is_fresh(expired, now));
    }

    #[test]
    fn cookie_without_expiry_is_refreshed() {
        assert!(!cookie_is_fresh("session=naked", Utc::now()));
    }

    #[test]
    fn expiry_margin_refreshes_just_in_time() {
        let now = Utc.with_ymd_and_hms(2040, 1, 2, 7, 59, 30).unwrap();
        // 30s left < 60s margin
        assert!(!cookie_is_fresh(COOKIE, now));
    }

    #[tokio::test]
    async fn session_cache_serves_fresh_cookie_across_stale_snapshots() {
        let cache = SessionCache::default();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();

        assert_eq!(cache.get_fresh(1, now).await, None);

        // A login stores the refreshed cookie; later calls holding a Server
        // snapshot with the old token must still get this one.
        cache.store(1, COOKIE).await;
        assert_eq!(cache.get_fresh(1, now).await, Some(COOKIE.to_string()));
        assert_eq!(cache.get_fresh(2, now).await, None);
    }

    #[tokio::test]
    async fn session_cache_never_serves_expired_cookies() {
        let cache = SessionCache::default();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();

        cache.store(1, "session=old; Expires=Tue, 01 Jan 2019 00:00:00 GMT").await;
        assert_eq!(cache.get_fresh(1, now).await, None);

        cache.store(1, COOKIE).await;
        assert_eq!(cache.get_fresh(1, now).await, Some(COOKIE.to_string()));
    }
}
