//! 存储服务接口
//!
//! 关联处理器通过该接口把解码后的对象交给入库流水线，
//! 协议层不关心字节落盘和元数据登记的细节。

use crate::decoder::DecodedObject;
use crate::dimse::status;
use async_trait::async_trait;
use receiver_core::{Facility, IngestionResult, IngestionStatus};

/// C-STORE对象的入库能力
#[async_trait]
pub trait StoreService: Send + Sync {
    /// 入库单个对象，失败也以结果形式返回，由调用方映射为DIMSE状态
    async fn ingest(&self, object: DecodedObject, facility: &Facility) -> IngestionResult;
}

/// 入库结果到C-STORE-RSP状态码的映射
pub fn dimse_status_for(result: &IngestionResult) -> u16 {
    match result.status {
        IngestionStatus::Stored | IngestionStatus::Duplicate => status::SUCCESS,
        IngestionStatus::Conflict => status::WARNING_COERCION,
        IngestionStatus::StorageFailed | IngestionStatus::MetadataFailed => {
            status::OUT_OF_RESOURCES
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            dimse_status_for(&IngestionResult::stored("/p".to_string())),
            status::SUCCESS
        );
        assert_eq!(
            dimse_status_for(&IngestionResult::duplicate("/p".to_string())),
            status::SUCCESS
        );
        assert_eq!(
            dimse_status_for(&IngestionResult::conflict("/p".to_string())),
            status::WARNING_COERCION
        );
        assert_eq!(
            dimse_status_for(&IngestionResult::storage_failed("磁盘写入失败")),
            status::OUT_OF_RESOURCES
        );
        assert_eq!(
            dimse_status_for(&IngestionResult::metadata_failed("事务失败", "/p".to_string())),
            status::OUT_OF_RESOURCES
        );
    }
}
