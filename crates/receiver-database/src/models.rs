//! 数据库模型

use chrono::{DateTime, Utc};
use receiver_core::models::*;
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库机构表
#[derive(Debug, FromRow)]
pub struct DbFacility {
    pub id: Uuid,
    pub name: String,
    pub ae_title: String,
    pub contact_email: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DbFacility> for Facility {
    fn from(db_facility: DbFacility) -> Self {
        Facility {
            id: db_facility.id,
            name: db_facility.name,
            ae_title: db_facility.ae_title,
            contact_email: db_facility.contact_email,
            is_active: db_facility.is_active,
            created_at: db_facility.created_at,
        }
    }
}

/// 数据库检查表
#[derive(Debug, FromRow)]
pub struct DbStudy {
    pub id: Uuid,
    pub study_uid: String,
    pub patient_id: String,
    pub facility_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub series_count: i32,
    pub created_at: DateTime<Utc>,
}

impl From<DbStudy> for Study {
    fn from(db_study: DbStudy) -> Self {
        Study {
            id: db_study.id,
            study_uid: db_study.study_uid,
            patient_id: db_study.patient_id,
            facility_id: db_study.facility_id,
            received_at: db_study.received_at,
            series_count: db_study.series_count,
            created_at: db_study.created_at,
        }
    }
}

/// 数据库序列表
#[derive(Debug, FromRow)]
pub struct DbSeries {
    pub id: Uuid,
    pub series_uid: String,
    pub study_id: Uuid,
    pub modality: String,
    pub instance_count: i32,
    pub created_at: DateTime<Utc>,
}

impl From<DbSeries> for Series {
    fn from(db_series: DbSeries) -> Self {
        Series {
            id: db_series.id,
            series_uid: db_series.series_uid,
            study_id: db_series.study_id,
            modality: db_series.modality,
            instance_count: db_series.instance_count,
            created_at: db_series.created_at,
        }
    }
}

/// 数据库实例表
#[derive(Debug, FromRow)]
pub struct DbSopInstance {
    pub id: Uuid,
    pub sop_instance_uid: String,
    pub series_id: Uuid,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub byte_length: i64,
    pub checksum: String,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

impl From<DbSopInstance> for SopInstance {
    fn from(db_instance: DbSopInstance) -> Self {
        SopInstance {
            id: db_instance.id,
            sop_instance_uid: db_instance.sop_instance_uid,
            series_id: db_instance.series_id,
            sop_class_uid: db_instance.sop_class_uid,
            transfer_syntax_uid: db_instance.transfer_syntax_uid,
            byte_length: db_instance.byte_length,
            checksum: db_instance.checksum,
            storage_path: db_instance.storage_path,
            created_at: db_instance.created_at,
        }
    }
}

/// 数据库冲突记录表
#[derive(Debug, FromRow)]
pub struct DbInstanceConflict {
    pub id: Uuid,
    pub sop_instance_uid: String,
    pub checksum: String,
    pub storage_path: String,
    pub received_at: DateTime<Utc>,
}

impl From<DbInstanceConflict> for InstanceConflict {
    fn from(db_conflict: DbInstanceConflict) -> Self {
        InstanceConflict {
            id: db_conflict.id,
            sop_instance_uid: db_conflict.sop_instance_uid,
            checksum: db_conflict.checksum,
            storage_path: db_conflict.storage_path,
            received_at: db_conflict.received_at,
        }
    }
}

// 插入模型 - 用于创建新记录

/// 新实例插入模型
///
/// 携带建立检查/序列/实例完整链条所需的全部字段，
/// 由入库流水线在字节持久化之后构造。
#[derive(Debug, Clone)]
pub struct NewSopInstance {
    pub study_uid: String,
    pub patient_id: String,
    pub facility_id: Uuid,
    pub series_uid: String,
    pub modality: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub byte_length: i64,
    pub checksum: String,
    pub storage_path: String,
}

/// 新冲突记录插入模型
#[derive(Debug, Clone)]
pub struct NewInstanceConflict {
    pub sop_instance_uid: String,
    pub checksum: String,
    pub storage_path: String,
}
