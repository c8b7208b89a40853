//! 影像元数据存储
//!
//! 检查/序列/实例链条的惰性创建在单个事务内完成，实例插入使用
//! `ON CONFLICT DO NOTHING`，由数据库唯一约束充当跨关联的串行化点：
//! 两个关联同时提交同一SOP Instance UID时恰好一个成功，另一个拿到
//! 已存在的行再走重复/冲突分支。

use crate::connection::DatabasePool;
use crate::models::*;
use async_trait::async_trait;
use chrono::Utc;
use receiver_core::{ReceiverError, Result, Series, SopInstance, Study};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 实例提交结果
#[derive(Debug)]
pub enum CommitOutcome {
    /// 本次提交创建了实例行
    Committed(SopInstance),
    /// 同UID的实例行已存在（先到者获胜），携带已存在的行
    AlreadyExists(SopInstance),
}

/// 元数据存储能力
///
/// 入库流水线只依赖该接口，生产环境用PostgreSQL实现，
/// 测试用内存实现。
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 按SOP Instance UID查找已登记的实例
    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<SopInstance>>;

    /// 原子提交检查/序列/实例链条
    ///
    /// 链条中缺失的检查和序列在同一事务内创建，派生计数同步更新。
    /// 实例行已存在时不做任何修改，返回已存在的行。
    async fn commit_instance(&self, new: &NewSopInstance) -> Result<CommitOutcome>;

    /// 追加一条内容冲突记录
    async fn record_conflict(&self, conflict: &NewInstanceConflict) -> Result<()>;

    /// 按检查UID查找检查
    async fn get_study_by_uid(&self, study_uid: &str) -> Result<Option<Study>>;

    /// 按序列UID查找序列
    async fn get_series_by_uid(&self, series_uid: &str) -> Result<Option<Series>>;
}

/// PostgreSQL元数据存储
pub struct PgMetadataStore {
    pool: DatabasePool,
}

impl PgMetadataStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<SopInstance>> {
        let result = sqlx::query_as::<_, DbSopInstance>(
            "SELECT * FROM instances WHERE sop_instance_uid = $1",
        )
        .bind(sop_instance_uid)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?;

        Ok(result.map(SopInstance::from))
    }

    async fn commit_instance(&self, new: &NewSopInstance) -> Result<CommitOutcome> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| ReceiverError::Database(e.to_string()))?;

        // 惰性创建检查
        sqlx::query(r#"
            INSERT INTO studies (id, study_uid, patient_id, facility_id, received_at, series_count)
            VALUES ($1, $2, $3, $4, NOW(), 0)
            ON CONFLICT (study_uid) DO NOTHING
        "#)
        .bind(Uuid::new_v4())
        .bind(&new.study_uid)
        .bind(&new.patient_id)
        .bind(new.facility_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?;

        let study = sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_uid = $1")
            .bind(&new.study_uid)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ReceiverError::Database(e.to_string()))?;

        // 惰性创建序列
        sqlx::query(r#"
            INSERT INTO series (id, series_uid, study_id, modality, instance_count)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (series_uid) DO NOTHING
        "#)
        .bind(Uuid::new_v4())
        .bind(&new.series_uid)
        .bind(study.id)
        .bind(&new.modality)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?;

        let series = sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE series_uid = $1")
            .bind(&new.series_uid)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ReceiverError::Database(e.to_string()))?;

        // 唯一约束保证同UID只有一行，并发提交时后到者插入0行
        let inserted = sqlx::query(r#"
            INSERT INTO instances (id, sop_instance_uid, series_id, sop_class_uid,
                                   transfer_syntax_uid, byte_length, checksum, storage_path)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (sop_instance_uid) DO NOTHING
        "#)
        .bind(Uuid::new_v4())
        .bind(&new.sop_instance_uid)
        .bind(series.id)
        .bind(&new.sop_class_uid)
        .bind(&new.transfer_syntax_uid)
        .bind(new.byte_length)
        .bind(&new.checksum)
        .bind(&new.storage_path)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?
        .rows_affected();

        let instance = sqlx::query_as::<_, DbSopInstance>(
            "SELECT * FROM instances WHERE sop_instance_uid = $1",
        )
        .bind(&new.sop_instance_uid)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?;

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| ReceiverError::Database(e.to_string()))?;
            return Ok(CommitOutcome::AlreadyExists(SopInstance::from(instance)));
        }

        // 更新派生计数
        sqlx::query(r#"
            UPDATE series SET instance_count =
                (SELECT COUNT(*) FROM instances WHERE series_id = $1)
            WHERE id = $1
        "#)
        .bind(series.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?;

        sqlx::query(r#"
            UPDATE studies SET series_count =
                (SELECT COUNT(*) FROM series WHERE study_id = $1)
            WHERE id = $1
        "#)
        .bind(study.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| ReceiverError::Database(e.to_string()))?;

        Ok(CommitOutcome::Committed(SopInstance::from(instance)))
    }

    async fn record_conflict(&self, conflict: &NewInstanceConflict) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO instance_conflicts (id, sop_instance_uid, checksum, storage_path, received_at)
            VALUES ($1, $2, $3, $4, NOW())
        "#)
        .bind(Uuid::new_v4())
        .bind(&conflict.sop_instance_uid)
        .bind(&conflict.checksum)
        .bind(&conflict.storage_path)
        .execute(self.pool.pool())
        .await
        .map_err(|e| ReceiverError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_study_by_uid(&self, study_uid: &str) -> Result<Option<Study>> {
        let result = sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_uid = $1")
            .bind(study_uid)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| ReceiverError::Database(e.to_string()))?;

        Ok(result.map(Study::from))
    }

    async fn get_series_by_uid(&self, series_uid: &str) -> Result<Option<Series>> {
        let result = sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE series_uid = $1")
            .bind(series_uid)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| ReceiverError::Database(e.to_string()))?;

        Ok(result.map(Series::from))
    }
}

/// 内存元数据存储
///
/// 语义与PostgreSQL实现一致，用于无数据库部署和测试。
#[derive(Default)]
pub struct InMemoryMetadataStore {
    inner: RwLock<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    studies: HashMap<String, Study>,
    series: HashMap<String, Series>,
    instances: HashMap<String, SopInstance>,
    conflicts: Vec<receiver_core::InstanceConflict>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已记录的冲突条目快照
    pub async fn conflicts(&self) -> Vec<receiver_core::InstanceConflict> {
        self.inner.read().await.conflicts.clone()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<SopInstance>> {
        Ok(self.inner.read().await.instances.get(sop_instance_uid).cloned())
    }

    async fn commit_instance(&self, new: &NewSopInstance) -> Result<CommitOutcome> {
        let mut state = self.inner.write().await;

        if let Some(existing) = state.instances.get(&new.sop_instance_uid) {
            return Ok(CommitOutcome::AlreadyExists(existing.clone()));
        }

        let now = Utc::now();
        let study_id = match state.studies.get(&new.study_uid) {
            Some(study) => study.id,
            None => {
                let study = Study {
                    id: Uuid::new_v4(),
                    study_uid: new.study_uid.clone(),
                    patient_id: new.patient_id.clone(),
                    facility_id: new.facility_id,
                    received_at: now,
                    series_count: 0,
                    created_at: now,
                };
                let id = study.id;
                state.studies.insert(new.study_uid.clone(), study);
                id
            }
        };

        let series_id = match state.series.get(&new.series_uid) {
            Some(series) => series.id,
            None => {
                let series = Series {
                    id: Uuid::new_v4(),
                    series_uid: new.series_uid.clone(),
                    study_id,
                    modality: new.modality.clone(),
                    instance_count: 0,
                    created_at: now,
                };
                let id = series.id;
                state.series.insert(new.series_uid.clone(), series);
                id
            }
        };

        let instance = SopInstance {
            id: Uuid::new_v4(),
            sop_instance_uid: new.sop_instance_uid.clone(),
            series_id,
            sop_class_uid: new.sop_class_uid.clone(),
            transfer_syntax_uid: new.transfer_syntax_uid.clone(),
            byte_length: new.byte_length,
            checksum: new.checksum.clone(),
            storage_path: new.storage_path.clone(),
            created_at: now,
        };
        state
            .instances
            .insert(new.sop_instance_uid.clone(), instance.clone());

        // 更新派生计数
        let instance_count = state
            .instances
            .values()
            .filter(|i| i.series_id == series_id)
            .count() as i32;
        if let Some(series) = state.series.get_mut(&new.series_uid) {
            series.instance_count = instance_count;
        }
        let series_count = state
            .series
            .values()
            .filter(|s| s.study_id == study_id)
            .count() as i32;
        if let Some(study) = state.studies.get_mut(&new.study_uid) {
            study.series_count = series_count;
        }

        Ok(CommitOutcome::Committed(instance))
    }

    async fn record_conflict(&self, conflict: &NewInstanceConflict) -> Result<()> {
        let mut state = self.inner.write().await;
        state.conflicts.push(receiver_core::InstanceConflict {
            id: Uuid::new_v4(),
            sop_instance_uid: conflict.sop_instance_uid.clone(),
            checksum: conflict.checksum.clone(),
            storage_path: conflict.storage_path.clone(),
            received_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_study_by_uid(&self, study_uid: &str) -> Result<Option<Study>> {
        Ok(self.inner.read().await.studies.get(study_uid).cloned())
    }

    async fn get_series_by_uid(&self, series_uid: &str) -> Result<Option<Series>> {
        Ok(self.inner.read().await.series.get(series_uid).cloned())
    }
}
