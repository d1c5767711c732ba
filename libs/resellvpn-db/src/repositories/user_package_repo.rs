use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::UserPackage;

#[derive(Debug, Clone)]
pub struct UserPackageRepository {
    pool: PgPool,
}

impl UserPackageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<UserPackage>> {
        let pack = sqlx::query_as::<_, UserPackage>("SELECT * FROM user_packages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user package")?;
        Ok(pack)
    }

    pub async fn get_for_user(&self, user_id: i64) -> Result<Vec<UserPackage>> {
        let packs = sqlx::query_as::<_, UserPackage>(
            "SELECT * FROM user_packages
             WHERE user_id = $1 AND deleted_at IS NULL
             ORDER BY order_n DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch user packages")?;
        Ok(packs)
    }

    pub async fn active_for_users(&self, user_ids: &[i64]) -> Result<Vec<UserPackage>> {
        let packs = sqlx::query_as::<_, UserPackage>(
            "SELECT * FROM user_packages
             WHERE user_id = ANY($1) AND deleted_at IS NULL AND finished_at IS NULL",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active packages for users")?;
        Ok(packs)
    }

    pub async fn next_order_n<'e, E>(executor: E, user_id: i64) -> Result<i32>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let last: Option<i32> =
            sqlx::query_scalar("SELECT MAX(order_n) FROM user_packages WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(executor)
                .await
                .context("Failed to fetch last order number")?;
        Ok(last.unwrap_or(0) + 1)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert<'e, E>(
        executor: E,
        user_id: i64,
        package_id: i64,
        server_id: i64,
        stat_id: Uuid,
        payment_id: Option<i64>,
        name: &str,
        order_n: i32,
    ) -> Result<UserPackage>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let pack = sqlx::query_as::<_, UserPackage>(
            r#"
            INSERT INTO user_packages
                (user_id, package_id, server_id, stat_id, payment_id, name, order_n)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(package_id)
        .bind(server_id)
        .bind(stat_id)
        .bind(payment_id)
        .bind(name)
        .bind(order_n)
        .fetch_one(executor)
        .await
        .context("Failed to insert user package")?;
        Ok(pack)
    }

    /// Soft delete: superseded by a renewal or cancelled by a rejection.
    pub async fn soft_delete(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE user_packages SET deleted_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to soft delete user package")?;
        Ok(())
    }

    /// Active packages over the given stats that have not been warned yet.
    pub async fn unwarned_active_by_stat_ids(&self, stat_ids: &[Uuid]) -> Result<Vec<UserPackage>> {
        let packs = sqlx::query_as::<_, UserPackage>(
            "SELECT * FROM user_packages
             WHERE stat_id = ANY($1)
               AND deleted_at IS NULL AND finished_at IS NULL
               AND threshold_warning_sent_at IS NULL",
        )
        .bind(stat_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unwarned packages")?;
        Ok(packs)
    }

    /// Bulk mark warned. Committed before any notification goes out so a
    /// dispatch failure can never produce a duplicate warning.
    pub async fn mark_warned(&self, ids: &[i64]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE user_packages SET threshold_warning_sent_at = CURRENT_TIMESTAMP
             WHERE id = ANY($1) AND threshold_warning_sent_at IS NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("Failed to mark packages warned")?;
        Ok(result.rows_affected())
    }

    pub async fn unfinished_active_by_stat_ids(
        &self,
        stat_ids: &[Uuid],
    ) -> Result<Vec<UserPackage>> {
        let packs = sqlx::query_as::<_, UserPackage>(
            "SELECT * FROM user_packages
             WHERE stat_id = ANY($1)
               AND deleted_at IS NULL AND finished_at IS NULL",
        )
        .bind(stat_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unfinished packages")?;
        Ok(packs)
    }

    /// Bulk close-out. Same mark-before-notify ordering as warnings.
    pub async fn mark_finished(&self, ids: &[i64]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE user_packages SET finished_at = CURRENT_TIMESTAMP
             WHERE id = ANY($1) AND finished_at IS NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("Failed to mark packages finished")?;
        Ok(result.rows_affected())
    }

    pub async fn mark_finished_by_stat_ids(&self, stat_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE user_packages SET finished_at = CURRENT_TIMESTAMP
             WHERE stat_id = ANY($1)
               AND deleted_at IS NULL AND finished_at IS NULL",
        )
        .bind(stat_ids)
        .execute(&self.pool)
        .await
        .context("Failed to mark packages finished by stat id")?;
        Ok(result.rows_affected())
    }
}
