use anyhow::{Context, Result};
use sqlx::PgPool;

/// Best-effort audit trail; callers ignore the result (`let _ =`).
#[derive(Debug, Clone)]
pub struct ActivityRepository {
    pool: PgPool,
}

impl ActivityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, user_id: Option<i64>, kind: &str, details: &str) -> Result<()> {
        sqlx::query("INSERT INTO activities (user_id, kind, details) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(kind)
            .bind(details)
            .execute(&self.pool)
            .await
            .context("Failed to log activity")?;
        Ok(())
    }
}
