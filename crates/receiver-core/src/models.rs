//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 机构信息
///
/// 由管理端创建，接收服务只读。AE标题全局唯一，
/// 与关联请求中出现的Called AE Title精确匹配（区分大小写）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facility {
    pub id: Uuid,
    pub name: String,                      // 机构名称
    pub ae_title: String,                  // AE标题（唯一）
    pub contact_email: Option<String>,     // 联系方式
    pub is_active: bool,                   // 是否启用
    pub created_at: DateTime<Utc>,
}

/// 检查信息
///
/// 在该检查的第一个实例到达时惰性创建，接收服务从不删除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: Uuid,
    pub study_uid: String,      // DICOM Study Instance UID
    pub patient_id: String,     // 患者标识（对本服务不透明）
    pub facility_id: Uuid,      // 来源机构
    pub received_at: DateTime<Utc>,
    pub series_count: i32,      // 派生计数
    pub created_at: DateTime<Utc>,
}

/// 序列信息
///
/// 在该序列的第一个实例到达时惰性创建。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: Uuid,
    pub series_uid: String,     // DICOM Series Instance UID
    pub study_id: Uuid,
    pub modality: String,       // 模态 (CT, MR, DR等)
    pub instance_count: i32,    // 派生计数
    pub created_at: DateTime<Utc>,
}

/// 影像实例信息
///
/// 入库成功后创建，之后不可变，永不静默覆盖。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SopInstance {
    pub id: Uuid,
    pub sop_instance_uid: String, // DICOM SOP Instance UID
    pub series_id: Uuid,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub byte_length: i64,
    pub checksum: String,         // 接收字节的SHA-256十六进制摘要
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

/// 实例内容冲突记录
///
/// 同一SOP Instance UID以不同校验和重复到达时追加一条记录，
/// 供人工复核；首份数据永不被覆盖。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConflict {
    pub id: Uuid,
    pub sop_instance_uid: String,
    pub checksum: String,       // 冲突副本的校验和
    pub storage_path: String,   // 消歧后的存储路径
    pub received_at: DateTime<Utc>,
}

/// 单个对象的入库结果状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionStatus {
    /// 新实例已持久化
    Stored,
    /// 相同UID且校验和一致的重发，幂等成功
    Duplicate,
    /// 相同UID但内容不同，已另存并标记
    Conflict,
    /// 字节写入失败，未持久化任何内容
    StorageFailed,
    /// 字节已写入但元数据事务失败，字节保留待对账
    MetadataFailed,
}

/// 单个对象的入库结果
///
/// 临时值，不持久化；返回给关联处理器用于生成DIMSE响应并记录日志。
#[derive(Debug, Clone)]
pub struct IngestionResult {
    pub status: IngestionStatus,
    pub message: String,
    pub storage_path: Option<String>,
}

impl IngestionResult {
    pub fn stored(path: String) -> Self {
        Self {
            status: IngestionStatus::Stored,
            message: "实例已持久化".to_string(),
            storage_path: Some(path),
        }
    }

    pub fn duplicate(path: String) -> Self {
        Self {
            status: IngestionStatus::Duplicate,
            message: "重复实例，幂等成功".to_string(),
            storage_path: Some(path),
        }
    }

    pub fn conflict(path: String) -> Self {
        Self {
            status: IngestionStatus::Conflict,
            message: "实例内容冲突，已另存并标记".to_string(),
            storage_path: Some(path),
        }
    }

    pub fn storage_failed(message: impl Into<String>) -> Self {
        Self {
            status: IngestionStatus::StorageFailed,
            message: message.into(),
            storage_path: None,
        }
    }

    pub fn metadata_failed(message: impl Into<String>, path: String) -> Self {
        Self {
            status: IngestionStatus::MetadataFailed,
            message: message.into(),
            storage_path: Some(path),
        }
    }

    /// 入库是否成功（重复视为成功，冲突视为警告级成功）
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            IngestionStatus::Stored | IngestionStatus::Duplicate
        )
    }
}
