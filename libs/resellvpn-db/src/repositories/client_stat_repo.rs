use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ClientStat;

/// One row of the bulk sync feed, as reported by the remote panel.
#[derive(Debug, Clone)]
pub struct StatUpsert {
    pub id: Uuid,
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
}

#[derive(Debug, Clone)]
pub struct ClientStatRepository {
    pool: PgPool,
}

impl ClientStatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<ClientStat>> {
        let stat = sqlx::query_as::<_, ClientStat>("SELECT * FROM client_stats WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch client stat")?;
        Ok(stat)
    }

    /// Single-statement bulk upsert of a sync tick. `last_connected_at` only
    /// moves forward: it is set to now() when the stat was online this tick
    /// and keeps its previous value otherwise.
    pub async fn bulk_upsert(
        &self,
        server_id: i64,
        stats: &[StatUpsert],
        online_ids: &[Uuid],
    ) -> Result<u64> {
        if stats.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(stats.len());
        let mut emails = Vec::with_capacity(stats.len());
        let mut sub_ids = Vec::with_capacity(stats.len());
        let mut tg_ids = Vec::with_capacity(stats.len());
        let mut flows = Vec::with_capacity(stats.len());
        let mut totals = Vec::with_capacity(stats.len());
        let mut ups = Vec::with_capacity(stats.len());
        let mut downs = Vec::with_capacity(stats.len());
        let mut expiries = Vec::with_capacity(stats.len());
        let mut enables = Vec::with_capacity(stats.len());
        let mut limit_ips = Vec::with_capacity(stats.len());
        let mut onlines = Vec::with_capacity(stats.len());

        for s in stats {
            ids.push(s.id);
            emails.push(s.email.clone());
            sub_ids.push(s.sub_id.clone());
            tg_ids.push(s.tg_id.clone());
            flows.push(s.flow.clone());
            totals.push(s.total);
            ups.push(s.up);
            downs.push(s.down);
            expiries.push(s.expiry_time);
            enables.push(s.enable);
            limit_ips.push(s.limit_ip);
            onlines.push(online_ids.contains(&s.id));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO client_stats
                (id, server_id, email, sub_id, tg_id, flow, total, up, down,
                 expiry_time, enable, limit_ip, last_connected_at)
            SELECT t.id, $1, t.email, t.sub_id, t.tg_id, t.flow, t.total,
                   t.up, t.down, t.expiry_time, t.enable, t.limit_ip,
                   CASE WHEN t.online THEN CURRENT_TIMESTAMP END
            FROM UNNEST(
                $2::uuid[], $3::text[], $4::text[], $5::text[], $6::text[],
                $7::bigint[], $8::bigint[], $9::bigint[], $10::bigint[],
                $11::boolean[], $12::int[], $13::boolean[]
            ) AS t(id, email, sub_id, tg_id, flow, total, up, down,
                   expiry_time, enable, limit_ip, online)
            ON CONFLICT (id) DO UPDATE SET
                total = excluded.total,
                up = excluded.up,
                down = excluded.down,
                expiry_time = excluded.expiry_time,
                enable = excluded.enable,
                limit_ip = excluded.limit_ip,
                flow = excluded.flow,
                sub_id = excluded.sub_id,
                tg_id = excluded.tg_id,
                last_connected_at = COALESCE(excluded.last_connected_at,
                                             client_stats.last_connected_at)
            "#,
        )
        .bind(server_id)
        .bind(&ids)
        .bind(&emails)
        .bind(&sub_ids)
        .bind(&tg_ids)
        .bind(&flows)
        .bind(&totals)
        .bind(&ups)
        .bind(&downs)
        .bind(&expiries)
        .bind(&enables)
        .bind(&limit_ips)
        .bind(&onlines)
        .execute(&self.pool)
        .await
        .context("Failed to bulk upsert client stats")?;

        Ok(result.rows_affected())
    }

    /// Upsert a single stat inside the purchase/renewal transaction.
    pub async fn upsert_one<'e, E>(executor: E, server_id: i64, stat: &StatUpsert) -> Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO client_stats
                (id, server_id, email, sub_id, tg_id, flow, total, up, down,
                 expiry_time, enable, limit_ip)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                server_id = excluded.server_id,
                total = excluded.total,
                up = excluded.up,
                down = excluded.down,
                expiry_time = excluded.expiry_time,
                enable = excluded.enable,
                limit_ip = excluded.limit_ip,
                missing_since = NULL
            "#,
        )
        .bind(stat.id)
        .bind(server_id)
        .bind(&stat.email)
        .bind(&stat.sub_id)
        .bind(&stat.tg_id)
        .bind(&stat.flow)
        .bind(stat.total)
        .bind(stat.up)
        .bind(stat.down)
        .bind(stat.expiry_time)
        .bind(stat.enable)
        .bind(stat.limit_ip)
        .execute(executor)
        .await
        .context("Failed to upsert client stat")?;
        Ok(())
    }

    /// Stat ids on this server whose owning UserPackage is still active.
    pub async fn active_stat_ids(&self, server_id: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT cs.id FROM client_stats cs
            JOIN user_packages up ON up.stat_id = cs.id
            WHERE cs.server_id = $1
              AND up.deleted_at IS NULL AND up.finished_at IS NULL
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active stat ids")?;
        Ok(ids)
    }

    /// Flagged-missing stat ids on this server whose owning UserPackage is
    /// still active.
    pub async fn flagged_active_ids(&self, server_id: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT cs.id FROM client_stats cs
            JOIN user_packages up ON up.stat_id = cs.id
            WHERE cs.server_id = $1
              AND cs.missing_since IS NOT NULL
              AND up.deleted_at IS NULL AND up.finished_at IS NULL
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch flagged missing stats")?;
        Ok(ids)
    }

    /// A stat seen again clears its missing flag.
    pub async fn clear_missing(&self, server_id: i64, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE client_stats SET missing_since = NULL
             WHERE server_id = $1 AND id = ANY($2) AND missing_since IS NOT NULL",
        )
        .bind(server_id)
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("Failed to clear missing flags")?;
        Ok(())
    }

    /// First miss: stamp the flag.
    pub async fn set_missing(&self, server_id: i64, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE client_stats SET missing_since = CURRENT_TIMESTAMP
             WHERE server_id = $1 AND id = ANY($2) AND missing_since IS NULL",
        )
        .bind(server_id)
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("Failed to set missing flags")?;
        Ok(())
    }
}
