use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Package;

#[derive(Debug, Clone)]
pub struct PackageRepository {
    pool: PgPool,
}

impl PackageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Package>> {
        let package = sqlx::query_as::<_, Package>("SELECT * FROM packages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch package")?;
        Ok(package)
    }

    pub async fn get_active(&self) -> Result<Vec<Package>> {
        let packages = sqlx::query_as::<_, Package>(
            "SELECT * FROM packages WHERE is_active = TRUE ORDER BY price",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active packages")?;
        Ok(packages)
    }
}
