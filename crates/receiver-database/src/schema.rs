//! 数据库表结构初始化

use crate::connection::DatabasePool;
use receiver_core::{ReceiverError, Result};

/// 创建数据库表
pub async fn create_tables(pool: &DatabasePool) -> Result<()> {
    let pool = pool.pool();

    // 创建机构表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS facilities (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            ae_title VARCHAR(16) UNIQUE NOT NULL,
            contact_email VARCHAR(255),
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| ReceiverError::Database(e.to_string()))?;

    // 创建检查表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS studies (
            id UUID PRIMARY KEY,
            study_uid VARCHAR(64) UNIQUE NOT NULL,
            patient_id VARCHAR(64) NOT NULL,
            facility_id UUID NOT NULL REFERENCES facilities(id),
            received_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            series_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| ReceiverError::Database(e.to_string()))?;

    // 创建序列表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS series (
            id UUID PRIMARY KEY,
            series_uid VARCHAR(64) UNIQUE NOT NULL,
            study_id UUID NOT NULL REFERENCES studies(id),
            modality VARCHAR(16) NOT NULL,
            instance_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| ReceiverError::Database(e.to_string()))?;

    // 创建实例表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS instances (
            id UUID PRIMARY KEY,
            sop_instance_uid VARCHAR(64) UNIQUE NOT NULL,
            series_id UUID NOT NULL REFERENCES series(id),
            sop_class_uid VARCHAR(64) NOT NULL,
            transfer_syntax_uid VARCHAR(64) NOT NULL,
            byte_length BIGINT NOT NULL,
            checksum CHAR(64) NOT NULL,
            storage_path VARCHAR(512) NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| ReceiverError::Database(e.to_string()))?;

    // 创建冲突记录表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS instance_conflicts (
            id UUID PRIMARY KEY,
            sop_instance_uid VARCHAR(64) NOT NULL,
            checksum CHAR(64) NOT NULL,
            storage_path VARCHAR(512) NOT NULL,
            received_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| ReceiverError::Database(e.to_string()))?;

    // 创建索引以优化查询性能
    let indexes = vec![
        "CREATE INDEX IF NOT EXISTS idx_facilities_ae_title ON facilities(ae_title)",
        "CREATE INDEX IF NOT EXISTS idx_studies_study_uid ON studies(study_uid)",
        "CREATE INDEX IF NOT EXISTS idx_studies_facility_id ON studies(facility_id)",
        "CREATE INDEX IF NOT EXISTS idx_series_series_uid ON series(series_uid)",
        "CREATE INDEX IF NOT EXISTS idx_series_study_id ON series(study_id)",
        "CREATE INDEX IF NOT EXISTS idx_instances_sop_instance_uid ON instances(sop_instance_uid)",
        "CREATE INDEX IF NOT EXISTS idx_instances_series_id ON instances(series_id)",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_sop_instance_uid ON instance_conflicts(sop_instance_uid)",
    ];

    for index_sql in indexes {
        sqlx::query(index_sql)
            .execute(pool)
            .await
            .map_err(|e| ReceiverError::Database(e.to_string()))?;
    }

    tracing::info!("数据库表结构初始化完成");
    Ok(())
}
