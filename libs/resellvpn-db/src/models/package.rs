use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Immutable commercial offer from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Package {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub traffic_gb: f64,
    pub expiration_days: i32,
    pub price: i64,
    pub user_count: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Package {
    pub fn traffic_bytes(&self) -> i64 {
        (self.traffic_gb * 1024.0 * 1024.0 * 1024.0) as i64
    }
}
