//! Workload name lookup for image naming.

use async_trait::async_trait;
use sqlx::PgPool;

use kiln_core::{WorkloadName, WorkloadResolver};

use crate::DbError;

#[derive(Debug, sqlx::FromRow)]
struct WorkloadRow {
    namespace: Option<String>,
    k8s_app: Option<String>,
    k8s_component_name: Option<String>,
}

impl WorkloadRow {
    /// A name only when every part is present.
    fn into_name(self) -> Option<WorkloadName> {
        let present = |s: Option<String>| s.filter(|s| !s.is_empty());
        Some(WorkloadName {
            namespace: present(self.namespace)?,
            app: present(self.k8s_app)?,
            component: present(self.k8s_component_name)?,
        })
    }
}

/// Resolves `namespace-app-component` from the tenant, application and
/// service tables.
pub struct PgWorkloadResolver {
    pool: PgPool,
}

impl PgWorkloadResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkloadResolver for PgWorkloadResolver {
    async fn workload_name(&self, service_id: &str) -> kiln_core::Result<Option<WorkloadName>> {
        let row = sqlx::query_as::<_, WorkloadRow>(
            r#"
            SELECT t.namespace, a.k8s_app, s.k8s_component_name
            FROM services s
            LEFT JOIN applications a ON a.app_id = s.app_id
            LEFT JOIN tenants t ON t.tenant_id = s.tenant_id
            WHERE s.service_id = $1
            "#,
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(row.and_then(WorkloadRow::into_name))
    }
}
