use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::User;

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by ID")?;
        Ok(user)
    }

    pub async fn get_children(&self, parent_id: i64) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users WHERE parent_id = $1")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch users by parent ID")?;
        Ok(users)
    }

    /// Chain from this node up to its root, nearest parent first.
    /// Pushed to SQL so the application never walks node-by-node.
    pub async fn list_ancestors(&self, id: i64) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            WITH RECURSIVE ancestors AS (
                SELECT u.*, 0 AS depth FROM users u WHERE u.id = $1
                UNION ALL
                SELECT p.*, a.depth + 1 FROM users p
                JOIN ancestors a ON p.id = a.parent_id
            )
            SELECT id, role, tg_id, balance, profit_balance, total_profit,
                   parent_id, profit_percent, initial_discount_percent,
                   applied_discount_percent, is_disabled, is_parent_disabled,
                   created_at
            FROM ancestors WHERE depth > 0 ORDER BY depth
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list ancestors")?;
        Ok(users)
    }

    /// Every node strictly below this one, shallowest first.
    pub async fn list_descendants(&self, id: i64) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            WITH RECURSIVE descendants AS (
                SELECT u.*, 0 AS depth FROM users u WHERE u.id = $1
                UNION ALL
                SELECT c.*, d.depth + 1 FROM users c
                JOIN descendants d ON c.parent_id = d.id
            )
            SELECT id, role, tg_id, balance, profit_balance, total_profit,
                   parent_id, profit_percent, initial_discount_percent,
                   applied_discount_percent, is_disabled, is_parent_disabled,
                   created_at
            FROM descendants WHERE depth > 0 ORDER BY depth
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list descendants")?;
        Ok(users)
    }

    /// Telegram chat ids for a batch of users; rows without one are skipped.
    pub async fn get_tg_ids(&self, user_ids: &[i64]) -> Result<Vec<(i64, i64)>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT id, tg_id FROM users WHERE id = ANY($1) AND tg_id IS NOT NULL",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch telegram ids")?;
        Ok(rows)
    }

    /// Atomic ledger increments; deltas may be negative. Never read-modify-
    /// write so concurrent sibling purchases touching the same parent are
    /// safe.
    pub async fn adjust_ledger<'e, E>(
        executor: E,
        user_id: i64,
        balance_delta: Decimal,
        profit_balance_delta: Decimal,
        total_profit_delta: Decimal,
    ) -> Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            "UPDATE users SET balance = balance + $1,
                              profit_balance = profit_balance + $2,
                              total_profit = total_profit + $3
             WHERE id = $4",
        )
        .bind(balance_delta)
        .bind(profit_balance_delta)
        .bind(total_profit_delta)
        .bind(user_id)
        .execute(executor)
        .await
        .context("Failed to adjust user ledger")?;
        Ok(())
    }

    pub async fn update_profit_percent(&self, id: i64, profit_percent: f64) -> Result<()> {
        sqlx::query("UPDATE users SET profit_percent = $1 WHERE id = $2")
            .bind(profit_percent)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update profit percent")?;
        Ok(())
    }

    pub async fn update_initial_discount_percent(&self, id: i64, discount: f64) -> Result<()> {
        sqlx::query("UPDATE users SET initial_discount_percent = $1 WHERE id = $2")
            .bind(discount)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update initial discount percent")?;
        Ok(())
    }

    pub async fn update_applied_discount_percent(&self, id: i64, discount: f64) -> Result<()> {
        sqlx::query("UPDATE users SET applied_discount_percent = $1 WHERE id = $2")
            .bind(discount)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update applied discount percent")?;
        Ok(())
    }

    /// One transaction: the node's own flag plus every direct child's
    /// parent-disabled flag. A child who disabled itself stays disabled when
    /// the parent is unblocked.
    pub async fn set_block_flags(&self, user_id: i64, blocked: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE users SET is_disabled = $1 WHERE id = $2")
            .bind(blocked)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE users SET is_parent_disabled = $1 WHERE parent_id = $2")
            .bind(blocked)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("Failed to commit block flags")?;
        Ok(())
    }

    pub async fn create(
        &self,
        role: &str,
        tg_id: Option<i64>,
        parent_id: Option<i64>,
        profit_percent: f64,
        initial_discount_percent: f64,
    ) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (role, tg_id, parent_id, profit_percent, initial_discount_percent)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(role)
        .bind(tg_id)
        .bind(parent_id)
        .bind(profit_percent)
        .bind(initial_discount_percent)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create user")?;
        Ok(user)
    }
}
