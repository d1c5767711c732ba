use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Local mirror of one panel-issued credential. `id` equals the provisioned
/// panel client id — the join key between local and remote truth.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClientStat {
    pub id: Uuid,
    pub server_id: i64,
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
    pub last_connected_at: Option<DateTime<Utc>>,
    pub missing_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ClientStat {
    pub fn used_bytes(&self) -> i64 {
        self.up + self.down
    }

    pub fn remaining_bytes(&self) -> i64 {
        (self.total - self.used_bytes()).max(0)
    }
}
