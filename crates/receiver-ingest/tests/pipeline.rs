//! 入库流水线行为测试

use receiver_core::{Facility, IngestionStatus};
use receiver_database::{InMemoryMetadataStore, MetadataStore};
use receiver_dicom::{DecodedObject, StoreService};
use receiver_ingest::IngestionPipeline;
use receiver_storage::{sha256_hex, ObjectStore};
use std::sync::Arc;

fn facility() -> Facility {
    Facility {
        id: uuid::Uuid::new_v4(),
        name: "测试机构".to_string(),
        ae_title: "ALPHA".to_string(),
        contact_email: None,
        is_active: true,
        created_at: chrono::Utc::now(),
    }
}

fn object(sop_uid: &str, payload: &[u8]) -> DecodedObject {
    DecodedObject {
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
        sop_instance_uid: sop_uid.to_string(),
        study_instance_uid: "1.2.840.7.1".to_string(),
        series_instance_uid: "1.2.840.7.1.1".to_string(),
        modality: "CT".to_string(),
        patient_id: "PAT001".to_string(),
        transfer_syntax_uid: "1.2.840.10008.1.2".to_string(),
        bytes: payload.to_vec(),
    }
}

struct Fixture {
    pipeline: IngestionPipeline,
    metadata: Arc<InMemoryMetadataStore>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let pipeline = IngestionPipeline::new(
        ObjectStore::new(dir.path()),
        Arc::clone(&metadata) as Arc<dyn MetadataStore>,
    );
    Fixture {
        pipeline,
        metadata,
        _dir: dir,
    }
}

#[tokio::test]
async fn first_store_persists_bytes_and_chain() {
    let fx = fixture();
    let fac = facility();
    let payload = b"dataset-bytes-0001";

    let result = fx.pipeline.ingest(object("1.2.3", payload), &fac).await;
    assert_eq!(result.status, IngestionStatus::Stored);
    let path = result.storage_path.unwrap();

    // 落盘字节与接收字节一致
    let on_disk = tokio::fs::read(&path).await.unwrap();
    assert_eq!(on_disk, payload);

    // 检查/序列/实例链条完整
    let instance = fx.metadata.find_instance("1.2.3").await.unwrap().unwrap();
    assert_eq!(instance.checksum, sha256_hex(payload));
    assert_eq!(instance.byte_length, payload.len() as i64);
    assert_eq!(instance.storage_path, path);

    let study = fx
        .metadata
        .get_study_by_uid("1.2.840.7.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(study.facility_id, fac.id);
    assert_eq!(study.series_count, 1);
    let series = fx
        .metadata
        .get_series_by_uid("1.2.840.7.1.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(series.instance_count, 1);
}

#[tokio::test]
async fn identical_resend_is_idempotent() {
    let fx = fixture();
    let fac = facility();
    let payload = b"dataset-bytes-0002";

    let first = fx.pipeline.ingest(object("1.2.4", payload), &fac).await;
    assert_eq!(first.status, IngestionStatus::Stored);

    let second = fx.pipeline.ingest(object("1.2.4", payload), &fac).await;
    assert_eq!(second.status, IngestionStatus::Duplicate);
    assert!(second.is_success());
    // 指向同一份存储，不产生新副本
    assert_eq!(second.storage_path, first.storage_path);

    let series = fx
        .metadata
        .get_series_by_uid("1.2.840.7.1.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(series.instance_count, 1);
}

#[tokio::test]
async fn different_content_same_uid_is_diverted() {
    let fx = fixture();
    let fac = facility();

    let first = fx.pipeline.ingest(object("1.2.5", b"original"), &fac).await;
    assert_eq!(first.status, IngestionStatus::Stored);
    let first_path = first.storage_path.unwrap();

    let second = fx.pipeline.ingest(object("1.2.5", b"tampered"), &fac).await;
    assert_eq!(second.status, IngestionStatus::Conflict);
    let conflict_path = second.storage_path.unwrap();
    assert_ne!(conflict_path, first_path);

    // 首份字节保持原样，冲突副本单独可读
    assert_eq!(tokio::fs::read(&first_path).await.unwrap(), b"original");
    assert_eq!(tokio::fs::read(&conflict_path).await.unwrap(), b"tampered");

    // 实例行未被改写，冲突已登记
    let instance = fx.metadata.find_instance("1.2.5").await.unwrap().unwrap();
    assert_eq!(instance.checksum, sha256_hex(b"original"));
    let conflicts = fx.metadata.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].sop_instance_uid, "1.2.5");
    assert_eq!(conflicts[0].checksum, sha256_hex(b"tampered"));
}

#[tokio::test]
async fn conflicting_resend_of_conflict_is_idempotent_per_checksum() {
    let fx = fixture();
    let fac = facility();

    fx.pipeline.ingest(object("1.2.6", b"original"), &fac).await;
    let c1 = fx.pipeline.ingest(object("1.2.6", b"variant"), &fac).await;
    let c2 = fx.pipeline.ingest(object("1.2.6", b"variant"), &fac).await;

    assert_eq!(c1.status, IngestionStatus::Conflict);
    assert_eq!(c2.status, IngestionStatus::Conflict);
    // 同一冲突副本落在同一消歧路径，字节不重复膨胀
    assert_eq!(c1.storage_path, c2.storage_path);
}

#[tokio::test]
async fn multiple_series_accumulate_counts() {
    let fx = fixture();
    let fac = facility();

    fx.pipeline.ingest(object("1.2.7", b"a"), &fac).await;
    let mut other = object("1.2.8", b"b");
    other.series_instance_uid = "1.2.840.7.1.2".to_string();
    other.modality = "MR".to_string();
    fx.pipeline.ingest(other, &fac).await;

    let study = fx
        .metadata
        .get_study_by_uid("1.2.840.7.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(study.series_count, 2);
}
