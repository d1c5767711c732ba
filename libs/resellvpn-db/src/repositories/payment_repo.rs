use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::{Payment, PaymentStatus, PaymentType};

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment")?;
        Ok(payment)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create<'e, E>(
        executor: E,
        payer_id: i64,
        amount: Decimal,
        payment_type: PaymentType,
        status: PaymentStatus,
        profit_amount: Decimal,
        parent_profit: Decimal,
        receipt_image: Option<&str>,
    ) -> Result<Payment>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments
                (payer_id, amount, type, status, profit_amount, parent_profit, receipt_image)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(payer_id)
        .bind(amount)
        .bind(payment_type.as_str())
        .bind(status.as_str())
        .bind(profit_amount)
        .bind(parent_profit)
        .bind(receipt_image)
        .fetch_one(executor)
        .await
        .context("Failed to create payment")?;
        Ok(payment)
    }

    /// One-way transition out of pending. Returns false when the payment was
    /// not pending (already settled), so callers cannot double-apply.
    pub async fn settle(&self, id: i64, to: PaymentStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE payments SET status = $1 WHERE id = $2 AND status = $3")
            .bind(to.as_str())
            .bind(id)
            .bind(PaymentStatus::Pending.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to settle payment")?;
        Ok(result.rows_affected() == 1)
    }
}
