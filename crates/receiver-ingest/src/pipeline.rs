//! 对象入库流水线
//!
//! 顺序固定：先算校验和做幂等判定，再落字节，最后提交元数据。
//! 字节落盘先于元数据事务，保证任何时刻元数据指向的文件都存在；
//! 反向的空洞（字节在、元数据缺）留给对账处理。

use async_trait::async_trait;
use receiver_core::{Facility, IngestionResult};
use receiver_database::{CommitOutcome, MetadataStore, NewInstanceConflict, NewSopInstance};
use receiver_dicom::{DecodedObject, StoreService};
use receiver_storage::{sha256_hex, ObjectStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// C-STORE对象入库流水线
pub struct IngestionPipeline {
    objects: ObjectStore,
    metadata: Arc<dyn MetadataStore>,
}

impl IngestionPipeline {
    pub fn new(objects: ObjectStore, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { objects, metadata }
    }

    /// 同UID不同内容：首份数据保持不变，新内容另存消歧路径并登记
    async fn divert_conflict(&self, object: &DecodedObject, checksum: &str) -> IngestionResult {
        let relative = self.objects.conflict_path(
            &object.study_instance_uid,
            &object.series_instance_uid,
            &object.sop_instance_uid,
            checksum,
        );
        let path = match self.objects.write(&relative, &object.bytes).await {
            Ok(p) => p,
            Err(e) => {
                return IngestionResult::storage_failed(format!("冲突副本写入失败: {}", e))
            }
        };
        if let Err(e) = self
            .metadata
            .record_conflict(&NewInstanceConflict {
                sop_instance_uid: object.sop_instance_uid.clone(),
                checksum: checksum.to_string(),
                storage_path: path.clone(),
            })
            .await
        {
            return IngestionResult::metadata_failed(format!("冲突记录登记失败: {}", e), path);
        }
        warn!(
            "实例内容冲突: sop={}, 新校验和={}",
            object.sop_instance_uid, checksum
        );
        IngestionResult::conflict(path)
    }
}

#[async_trait]
impl StoreService for IngestionPipeline {
    async fn ingest(&self, object: DecodedObject, facility: &Facility) -> IngestionResult {
        let checksum = sha256_hex(&object.bytes);

        // 幂等判定：同UID同内容的重发直接成功，不产生新副本
        match self.metadata.find_instance(&object.sop_instance_uid).await {
            Ok(Some(existing)) => {
                if existing.checksum == checksum {
                    debug!("重复实例: sop={}", object.sop_instance_uid);
                    return IngestionResult::duplicate(existing.storage_path);
                }
                return self.divert_conflict(&object, &checksum).await;
            }
            Ok(None) => {}
            Err(e) => {
                // 尚未写入任何字节，直接失败
                return IngestionResult::storage_failed(format!("元数据查询失败: {}", e));
            }
        }

        // 字节先行落盘
        let relative = self.objects.instance_path(
            &object.study_instance_uid,
            &object.series_instance_uid,
            &object.sop_instance_uid,
        );
        let path = match self.objects.write(&relative, &object.bytes).await {
            Ok(p) => p,
            Err(e) => return IngestionResult::storage_failed(format!("字节写入失败: {}", e)),
        };

        // 元数据事务
        let new = NewSopInstance {
            study_uid: object.study_instance_uid.clone(),
            patient_id: object.patient_id.clone(),
            facility_id: facility.id,
            series_uid: object.series_instance_uid.clone(),
            modality: object.modality.clone(),
            sop_instance_uid: object.sop_instance_uid.clone(),
            sop_class_uid: object.sop_class_uid.clone(),
            transfer_syntax_uid: object.transfer_syntax_uid.clone(),
            byte_length: object.bytes.len() as i64,
            checksum: checksum.clone(),
            storage_path: path.clone(),
        };
        match self.metadata.commit_instance(&new).await {
            Ok(CommitOutcome::Committed(_)) => IngestionResult::stored(path),
            // 并发竞态：另一关联抢先提交了同UID，按已存在的行重新判定
            Ok(CommitOutcome::AlreadyExists(existing)) => {
                if existing.checksum == checksum {
                    IngestionResult::duplicate(existing.storage_path)
                } else {
                    self.divert_conflict(&object, &checksum).await
                }
            }
            // 字节已持久化，保留给对账
            Err(e) => IngestionResult::metadata_failed(format!("元数据提交失败: {}", e), path),
        }
    }
}
