use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::PromoCode;

#[derive(Debug, Clone)]
pub struct PromoRepository {
    pool: PgPool,
}

impl PromoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, code: &str, max_uses: i32) -> Result<PromoCode> {
        let promo = sqlx::query_as::<_, PromoCode>(
            "INSERT INTO promo_codes (code, max_uses) VALUES ($1, $2) RETURNING *",
        )
        .bind(code)
        .bind(max_uses)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create promo code")?;
        Ok(promo)
    }

    pub async fn get_valid(&self, code: &str) -> Result<Option<PromoCode>> {
        let promo = sqlx::query_as::<_, PromoCode>(
            "SELECT * FROM promo_codes
             WHERE code = $1
               AND is_active = TRUE
               AND current_uses < max_uses
               AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to validate promo code")?;
        Ok(promo)
    }

    /// Guarded increment; returns false when the code ran out concurrently.
    pub async fn consume(&self, code: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE promo_codes SET current_uses = current_uses + 1
             WHERE code = $1 AND is_active = TRUE AND current_uses < max_uses",
        )
        .bind(code)
        .execute(&self.pool)
        .await
        .context("Failed to consume promo code")?;
        Ok(result.rows_affected() == 1)
    }
}
