//! Version record repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use kiln_core::{VersionKey, VersionRecord, VersionStore, VersionUpdate};

use crate::{DbError, DbResult};

const COLUMNS: &str = "service_id, deploy_version, event_id, delivered_type, delivered_path, \
                       image_name, final_status, code_version, code_branch, commit_msg, author, \
                       finish_time";

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct VersionRow {
    pub service_id: String,
    pub deploy_version: String,
    pub event_id: String,
    pub delivered_type: Option<String>,
    pub delivered_path: Option<String>,
    pub image_name: Option<String>,
    pub final_status: Option<String>,
    pub code_version: Option<String>,
    pub code_branch: Option<String>,
    pub commit_msg: Option<String>,
    pub author: Option<String>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl TryFrom<VersionRow> for VersionRecord {
    type Error = DbError;

    fn try_from(row: VersionRow) -> DbResult<Self> {
        let delivered_type = row
            .delivered_type
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(DbError::InvalidRow)?;
        let final_status = row
            .final_status
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(DbError::InvalidRow)?;
        Ok(VersionRecord {
            key: VersionKey::new(row.service_id, row.deploy_version),
            event_id: row.event_id,
            delivered_type,
            delivered_path: row.delivered_path,
            image_name: row.image_name,
            final_status,
            code_version: row.code_version,
            code_branch: row.code_branch,
            commit_msg: row.commit_msg,
            author: row.author,
            finish_time: row.finish_time,
        })
    }
}

/// PostgreSQL implementation of [`VersionStore`].
///
/// Upserts run in a transaction holding a row lock, so concurrent writers
/// for the same key apply their updates one after the other and a terminal
/// status is never overwritten.
pub struct PgVersionStore {
    pool: PgPool,
}

impl PgVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, key: &VersionKey) -> DbResult<Option<VersionRecord>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {} FROM version_records WHERE service_id = $1 AND deploy_version = $2",
            COLUMNS
        ))
        .bind(&key.service_id)
        .bind(&key.deploy_version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(VersionRecord::try_from).transpose()
    }

    async fn write(&self, key: &VersionKey, update: &VersionUpdate) -> DbResult<VersionRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO version_records (service_id, deploy_version) VALUES ($1, $2) \
             ON CONFLICT (service_id, deploy_version) DO NOTHING",
        )
        .bind(&key.service_id)
        .bind(&key.deploy_version)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {} FROM version_records WHERE service_id = $1 AND deploy_version = $2 FOR UPDATE",
            COLUMNS
        ))
        .bind(&key.service_id)
        .bind(&key.deploy_version)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!("version {}/{}", key.service_id, key.deploy_version))
        })?;

        let mut record = VersionRecord::try_from(row)?;
        record.apply(update);

        sqlx::query(
            r#"
            UPDATE version_records SET
                event_id = $3,
                delivered_type = $4,
                delivered_path = $5,
                image_name = $6,
                final_status = $7,
                code_version = $8,
                code_branch = $9,
                commit_msg = $10,
                author = $11,
                finish_time = $12,
                updated_at = NOW()
            WHERE service_id = $1 AND deploy_version = $2
            "#,
        )
        .bind(&key.service_id)
        .bind(&key.deploy_version)
        .bind(&record.event_id)
        .bind(record.delivered_type.map(|m| m.as_str()))
        .bind(&record.delivered_path)
        .bind(&record.image_name)
        .bind(record.final_status.map(|s| s.as_str()))
        .bind(&record.code_version)
        .bind(&record.code_branch)
        .bind(&record.commit_msg)
        .bind(&record.author)
        .bind(record.finish_time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(service_id = %key.service_id, deploy_version = %key.deploy_version, status = ?record.final_status, "Version record written");
        Ok(record)
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn get(&self, key: &VersionKey) -> kiln_core::Result<Option<VersionRecord>> {
        Ok(self.fetch(key).await?)
    }

    async fn upsert(&self, key: &VersionKey, update: &VersionUpdate) -> kiln_core::Result<VersionRecord> {
        Ok(self.write(key, update).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{BuildResponse, FinalStatus, Medium};

    fn row() -> VersionRow {
        VersionRow {
            service_id: "svc".into(),
            deploy_version: "v1".into(),
            event_id: "ev".into(),
            delivered_type: Some("slug".into()),
            delivered_path: Some("/slug/v1.tgz".into()),
            image_name: None,
            final_status: Some("success".into()),
            code_version: Some("abc".into()),
            code_branch: Some("main".into()),
            commit_msg: None,
            author: None,
            finish_time: Some(Utc::now()),
        }
    }

    #[test]
    fn test_row_to_record() {
        let record = VersionRecord::try_from(row()).unwrap();
        assert_eq!(record.key, VersionKey::new("svc", "v1"));
        assert_eq!(record.delivered_type, Some(Medium::Slug));
        assert_eq!(record.final_status, Some(FinalStatus::Success));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let mut bad = row();
        bad.final_status = Some("pending".into());
        assert!(matches!(VersionRecord::try_from(bad), Err(DbError::InvalidRow(_))));
    }

    /// Requires DATABASE_URL pointing at a scratch database.
    #[tokio::test]
    #[ignore]
    async fn test_upsert_never_reopens_terminal_status() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = crate::create_pool(&url).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        let store = PgVersionStore::new(pool);
        let key = VersionKey::new("svc-test", kiln_core::TaskId::new().to_string());

        store.upsert(&key, &VersionUpdate::failure("ev")).await.unwrap();
        let response = BuildResponse {
            medium: Medium::Image,
            path: "goodrain.me/svc-test:v1".into(),
        };
        let record = store
            .upsert(&key, &VersionUpdate::success("ev", &response))
            .await
            .unwrap();

        assert_eq!(record.final_status, Some(FinalStatus::Failure));
        assert_eq!(record.image_name.as_deref(), Some("goodrain.me/svc-test:v1"));
        assert_eq!(store.get(&key).await.unwrap().unwrap(), record);
    }
}
