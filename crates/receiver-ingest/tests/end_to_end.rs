//! 端到端场景：SCU经真实TCP向服务发送对象，验证字节与元数据链条

use futures::{SinkExt, StreamExt};
use receiver_core::{Facility, StaticFacilityRegistry};
use receiver_database::{InMemoryMetadataStore, MetadataStore};
use receiver_dicom::dimse::{self, status};
use receiver_dicom::pdu::{AssociateRq, Pdu, PduCodec, Pdv, ProposedPresentationContext};
use receiver_dicom::transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN;
use receiver_dicom::{DicomServer, DicomServerConfig};
use receiver_ingest::IngestionPipeline;
use receiver_storage::{sha256_hex, ObjectStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

struct Deployment {
    addr: SocketAddr,
    metadata: Arc<InMemoryMetadataStore>,
    storage_root: tempfile::TempDir,
    _shutdown: watch::Sender<bool>,
}

async fn deploy() -> Deployment {
    let storage_root = tempfile::tempdir().unwrap();
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let pipeline = Arc::new(IngestionPipeline::new(
        ObjectStore::new(storage_root.path()),
        Arc::clone(&metadata) as Arc<dyn MetadataStore>,
    ));
    let registry = Arc::new(StaticFacilityRegistry::new(vec![Facility {
        id: uuid::Uuid::new_v4(),
        name: "影像中心A".to_string(),
        ae_title: "ALPHA".to_string(),
        contact_email: None,
        is_active: true,
        created_at: chrono::Utc::now(),
    }]));
    let config = DicomServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        idle_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    };
    let server = DicomServer::bind(config, registry, pipeline).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(server.run(rx));
    Deployment {
        addr,
        metadata,
        storage_root,
        _shutdown: tx,
    }
}

fn associate_rq(called: &str) -> AssociateRq {
    AssociateRq {
        called_ae_title: called.to_string(),
        calling_ae_title: "MODALITY_01".to_string(),
        application_context: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![ProposedPresentationContext {
            id: 1,
            abstract_syntax: CT_IMAGE_STORAGE.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
        }],
        max_pdu_length: 16384,
    }
}

async fn recv(framed: &mut Framed<TcpStream, PduCodec>) -> Pdu {
    tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("等待响应超时")
        .expect("连接意外关闭")
        .expect("PDU解码失败")
}

fn sample_dataset(sop_instance_uid: &str) -> Vec<u8> {
    sample_dataset_for_patient(sop_instance_uid, "PAT777")
}

fn sample_dataset_for_patient(sop_instance_uid: &str, patient_id: &str) -> Vec<u8> {
    use dicom::object::InMemDicomObject;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use dicom_transfer_syntax_registry::entries;

    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, CT_IMAGE_STORAGE)),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.99.1"),
        ),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.99.1.1"),
        ),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient_id)),
    ]);
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut out = Vec::new();
    obj.write_dataset_with_ts(&mut out, &ts).unwrap();
    out
}

/// 建立关联、发送一个C-STORE并返回响应状态码
async fn send_store(addr: SocketAddr, sop_uid: &str, dataset: &[u8]) -> u16 {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, PduCodec::new(1024 * 1024));
    framed
        .send(Pdu::AssociateRq(associate_rq("ALPHA")))
        .await
        .unwrap();
    match recv(&mut framed).await {
        Pdu::AssociateAc(_) => {}
        other => panic!("期望A-ASSOCIATE-AC, 得到 {:?}", other),
    }

    framed
        .send(Pdu::PData(vec![Pdv {
            presentation_context_id: 1,
            is_command: true,
            is_last: true,
            data: dimse::build_cstore_rq(1, CT_IMAGE_STORAGE, sop_uid).unwrap(),
        }]))
        .await
        .unwrap();
    framed
        .send(Pdu::PData(vec![Pdv {
            presentation_context_id: 1,
            is_command: false,
            is_last: true,
            data: dataset.to_vec(),
        }]))
        .await
        .unwrap();

    let rsp_status = match recv(&mut framed).await {
        Pdu::PData(pdvs) => {
            let cmd = dimse::parse_command(&pdvs[0].data).unwrap();
            assert_eq!(cmd.command_field, dimse::C_STORE_RSP);
            cmd.status.unwrap()
        }
        other => panic!("期望P-DATA-TF, 得到 {:?}", other),
    };

    framed.send(Pdu::ReleaseRq).await.unwrap();
    assert_eq!(recv(&mut framed).await, Pdu::ReleaseRp);
    rsp_status
}

#[tokio::test]
async fn store_then_resend_then_reject_unknown_ae() {
    let deployment = deploy().await;
    let dataset = sample_dataset("1.2.840.99.1.1.7");

    // 首次入库成功
    let st = send_store(deployment.addr, "1.2.840.99.1.1.7", &dataset).await;
    assert_eq!(st, status::SUCCESS);

    // 元数据链条可查
    let instance = deployment
        .metadata
        .find_instance("1.2.840.99.1.1.7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.checksum, sha256_hex(&dataset));
    let study = deployment
        .metadata
        .get_study_by_uid("1.2.840.99.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(study.patient_id, "PAT777");

    // 字节原样落在规范路径下
    let on_disk = tokio::fs::read(&instance.storage_path).await.unwrap();
    assert_eq!(on_disk, dataset);
    assert!(instance
        .storage_path
        .starts_with(&deployment.storage_root.path().to_string_lossy().to_string()));

    // 新关联重发同一对象：幂等成功，实例数不变
    let st = send_store(deployment.addr, "1.2.840.99.1.1.7", &dataset).await;
    assert_eq!(st, status::SUCCESS);
    let series = deployment
        .metadata
        .get_series_by_uid("1.2.840.99.1.1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(series.instance_count, 1);

    // 未注册的Called AE被永久拒绝
    let stream = TcpStream::connect(deployment.addr).await.unwrap();
    let mut framed = Framed::new(stream, PduCodec::new(1024 * 1024));
    framed
        .send(Pdu::AssociateRq(associate_rq("BETA")))
        .await
        .unwrap();
    match recv(&mut framed).await {
        Pdu::AssociateRj(rj) => {
            assert_eq!((rj.result, rj.source, rj.reason), (1, 1, 7));
        }
        other => panic!("期望A-ASSOCIATE-RJ, 得到 {:?}", other),
    }
}

#[tokio::test]
async fn tampered_resend_reports_warning_and_keeps_first_bytes() {
    let deployment = deploy().await;
    let dataset = sample_dataset("1.2.840.99.1.1.8");

    let st = send_store(deployment.addr, "1.2.840.99.1.1.8", &dataset).await;
    assert_eq!(st, status::SUCCESS);

    // 同UID但内容不同的数据集
    let tampered = sample_dataset_for_patient("1.2.840.99.1.1.8", "PAT778");
    assert_ne!(tampered, dataset);
    let st = send_store(deployment.addr, "1.2.840.99.1.1.8", &tampered).await;
    assert_eq!(st, status::WARNING_COERCION);

    // 首份字节未被覆盖
    let instance = deployment
        .metadata
        .find_instance("1.2.840.99.1.1.8")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        tokio::fs::read(&instance.storage_path).await.unwrap(),
        dataset
    );
    let conflicts = deployment.metadata.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].checksum, sha256_hex(&tampered));
}
