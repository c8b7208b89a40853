//! PostgreSQL机构注册表

use crate::connection::DatabasePool;
use crate::models::DbFacility;
use async_trait::async_trait;
use receiver_core::{Facility, FacilityRegistry, ReceiverError, Result};

/// 以facilities表为后端的AE注册表
///
/// 查询失败映射为注册表错误，调用方据此拒绝关联而不是放行。
pub struct PgFacilityRegistry {
    pool: DatabasePool,
}

impl PgFacilityRegistry {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FacilityRegistry for PgFacilityRegistry {
    async fn lookup(&self, called_ae_title: &str) -> Result<Option<Facility>> {
        let result = sqlx::query_as::<_, DbFacility>(
            "SELECT * FROM facilities WHERE ae_title = $1 AND is_active = TRUE",
        )
        .bind(called_ae_title)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| ReceiverError::Registry(e.to_string()))?;

        Ok(result.map(Facility::from))
    }
}
