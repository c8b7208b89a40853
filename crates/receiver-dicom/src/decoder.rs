//! 数据集解码
//!
//! 按协商到的传输语法解析数据集并提取入库所需标识。原始字节
//! 原样保留，存储侧写盘的就是这份字节，绝不重编码。

use dicom::object::{InMemDicomObject, StandardDataDictionary};
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use receiver_core::{utils, ReceiverError, Result};

/// 解码后的影像对象
///
/// `bytes`是接收到的完整数据集字节，校验和与落盘都以它为准。
#[derive(Debug, Clone)]
pub struct DecodedObject {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub modality: String,
    pub patient_id: String,
    pub transfer_syntax_uid: String,
    pub bytes: Vec<u8>,
}

/// 解码数据集并校验必需标识
///
/// 四个UID（SOP类/SOP实例/检查/序列）缺失或格式非法都视为解码失败，
/// 调用方据此返回0xC000且不落盘任何字节。
pub fn decode_dataset(bytes: Vec<u8>, transfer_syntax_uid: &str) -> Result<DecodedObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .ok_or_else(|| {
            ReceiverError::Decode(format!("未知传输语法: {}", transfer_syntax_uid))
        })?;

    let obj = InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)
        .map_err(|e| ReceiverError::Decode(format!("数据集解析失败: {}", e)))?;

    let sop_class_uid = required_uid(&obj, tags::SOP_CLASS_UID, "SOP Class UID")?;
    let sop_instance_uid = required_uid(&obj, tags::SOP_INSTANCE_UID, "SOP Instance UID")?;
    let study_instance_uid = required_uid(&obj, tags::STUDY_INSTANCE_UID, "Study Instance UID")?;
    let series_instance_uid =
        required_uid(&obj, tags::SERIES_INSTANCE_UID, "Series Instance UID")?;

    let modality = optional_str(&obj, tags::MODALITY).unwrap_or_else(|| "OT".to_string());
    let patient_id =
        optional_str(&obj, tags::PATIENT_ID).unwrap_or_else(|| "UNKNOWN".to_string());

    Ok(DecodedObject {
        sop_class_uid,
        sop_instance_uid,
        study_instance_uid,
        series_instance_uid,
        modality,
        patient_id,
        transfer_syntax_uid: transfer_syntax_uid.to_string(),
        bytes,
    })
}

fn required_uid(
    obj: &InMemDicomObject<StandardDataDictionary>,
    tag: Tag,
    name: &str,
) -> Result<String> {
    let raw = obj
        .element(tag)
        .map_err(|_| ReceiverError::Decode(format!("数据集缺少{}", name)))?
        .to_str()
        .map_err(|_| ReceiverError::Decode(format!("{}读取失败", name)))?;
    let uid = utils::trim_uid(&raw).to_string();
    if !utils::is_valid_dicom_uid(&uid) {
        return Err(ReceiverError::Decode(format!("{}格式非法: {:?}", name, uid)));
    }
    Ok(uid)
}

fn optional_str(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer_syntax::IMPLICIT_VR_LITTLE_ENDIAN;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_transfer_syntax_registry::entries;

    fn encode(obj: &InMemDicomObject<StandardDataDictionary>) -> Vec<u8> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut out = Vec::new();
        obj.write_dataset_with_ts(&mut out, &ts).unwrap();
        out
    }

    fn sample_object() -> InMemDicomObject<StandardDataDictionary> {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2"),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4.5"),
            ),
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3"),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4"),
            ),
            DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "PAT001")),
        ])
    }

    #[test]
    fn test_decode_extracts_identifiers() {
        let bytes = encode(&sample_object());
        let decoded = decode_dataset(bytes.clone(), IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(decoded.sop_instance_uid, "1.2.3.4.5");
        assert_eq!(decoded.study_instance_uid, "1.2.3");
        assert_eq!(decoded.series_instance_uid, "1.2.3.4");
        assert_eq!(decoded.modality, "CT");
        assert_eq!(decoded.patient_id, "PAT001");
        // 原始字节原样保留
        assert_eq!(decoded.bytes, bytes);
    }

    #[test]
    fn test_missing_sop_instance_uid_fails() {
        let mut obj = sample_object();
        obj.remove_element(tags::SOP_INSTANCE_UID);
        assert!(decode_dataset(encode(&obj), IMPLICIT_VR_LITTLE_ENDIAN).is_err());
    }

    #[test]
    fn test_invalid_uid_characters_fail() {
        let mut obj = sample_object();
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "not-a-uid"),
        ));
        assert!(decode_dataset(encode(&obj), IMPLICIT_VR_LITTLE_ENDIAN).is_err());
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let mut obj = sample_object();
        obj.remove_element(tags::MODALITY);
        obj.remove_element(tags::PATIENT_ID);
        let decoded = decode_dataset(encode(&obj), IMPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(decoded.modality, "OT");
        assert_eq!(decoded.patient_id, "UNKNOWN");
    }

    #[test]
    fn test_unknown_transfer_syntax_fails() {
        let bytes = encode(&sample_object());
        assert!(decode_dataset(bytes, "9.9.9").is_err());
    }
}
