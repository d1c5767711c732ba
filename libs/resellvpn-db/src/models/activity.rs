use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Activity {
    pub id: i64,
    pub user_id: Option<i64>,
    pub kind: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}
