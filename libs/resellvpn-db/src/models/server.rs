use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A provisioning target. `token` holds the raw panel session cookie as
/// returned by the last login; expiry is read from the cookie itself.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: i64,
    pub domain: String,
    pub inbound_id: i32,
    pub token: Option<String>,
    pub is_active: bool,
    pub health_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn base_url(&self) -> String {
        format!("https://{}", self.domain)
    }
}
