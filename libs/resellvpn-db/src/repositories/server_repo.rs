use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Server;

#[derive(Debug, Clone)]
pub struct ServerRepository {
    pool: PgPool,
}

impl ServerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Server>> {
        let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch server")?;
        Ok(server)
    }

    pub async fn get_active(&self) -> Result<Vec<Server>> {
        let servers =
            sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE is_active = TRUE ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch active servers")?;
        Ok(servers)
    }

    /// Last-write-wins on purpose: concurrent logins may both store a valid
    /// cookie and either one works.
    pub async fn update_token(&self, id: i64, token: &str) -> Result<()> {
        sqlx::query("UPDATE servers SET token = $1 WHERE id = $2")
            .bind(token)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update server token")?;
        Ok(())
    }

    pub async fn update_health_score(&self, id: i64, score: f64) -> Result<()> {
        sqlx::query("UPDATE servers SET health_score = $1 WHERE id = $2")
            .bind(score)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update server health score")?;
        Ok(())
    }
}
