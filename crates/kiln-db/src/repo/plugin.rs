//! Plugin build record repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use kiln_core::{PluginBuildRecord, PluginBuildStore};

use crate::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct PluginBuildRow {
    plugin_id: String,
    version_id: String,
    event_id: String,
    status: String,
    image: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PluginBuildRow> for PluginBuildRecord {
    type Error = DbError;

    fn try_from(row: PluginBuildRow) -> DbResult<Self> {
        Ok(PluginBuildRecord {
            status: row.status.parse().map_err(DbError::InvalidRow)?,
            plugin_id: row.plugin_id,
            version_id: row.version_id,
            event_id: row.event_id,
            image: row.image,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL implementation of [`PluginBuildStore`].
pub struct PgPluginBuildStore {
    pool: PgPool,
}

impl PgPluginBuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PluginBuildStore for PgPluginBuildStore {
    async fn get(
        &self,
        plugin_id: &str,
        version_id: &str,
    ) -> kiln_core::Result<Option<PluginBuildRecord>> {
        let row = sqlx::query_as::<_, PluginBuildRow>(
            "SELECT plugin_id, version_id, event_id, status, image, updated_at \
             FROM plugin_builds WHERE plugin_id = $1 AND version_id = $2",
        )
        .bind(plugin_id)
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(row.map(PluginBuildRecord::try_from).transpose()?)
    }

    async fn put(&self, record: PluginBuildRecord) -> kiln_core::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_builds (plugin_id, version_id, event_id, status, image, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (plugin_id, version_id) DO UPDATE SET
                event_id = EXCLUDED.event_id,
                status = EXCLUDED.status,
                image = COALESCE(EXCLUDED.image, plugin_builds.image),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.plugin_id)
        .bind(&record.version_id)
        .bind(&record.event_id)
        .bind(record.status.as_str())
        .bind(&record.image)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}
