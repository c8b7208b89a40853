//! DIMSE命令集编解码
//!
//! 命令集固定以隐式VR小端编码，与数据集协商到的传输语法无关。
//! 本服务只处理C-ECHO和C-STORE两类请求。

use dicom::object::{InMemDicomObject, StandardDataDictionary};
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_transfer_syntax_registry::entries;
use receiver_core::{utils, ReceiverError, Result};

/// 命令字段值
pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;

/// CommandDataSetType为该值时命令不携带数据集
pub const NO_DATA_SET: u16 = 0x0101;

/// DIMSE状态码
pub mod status {
    /// 成功
    pub const SUCCESS: u16 = 0x0000;
    /// 警告：属性值与已有数据不一致（用于内容冲突）
    pub const WARNING_COERCION: u16 = 0xB000;
    /// 无法理解数据集
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
    /// 资源不足，未能持久化
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    /// SOP类与协商的表示上下文不符
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
}

/// 解析后的DIMSE命令集
#[derive(Debug, Clone)]
pub struct CommandSet {
    pub command_field: u16,
    pub message_id: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    /// 响应中携带的状态码
    pub status: Option<u16>,
    /// 命令后是否跟随数据集
    pub has_data_set: bool,
}

/// 从命令PDV的完整字节解析命令集
pub fn parse_command(data: &[u8]) -> Result<CommandSet> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = InMemDicomObject::read_dataset_with_ts(data, &ts)
        .map_err(|e| ReceiverError::Protocol(format!("命令集解析失败: {}", e)))?;

    let command_field = obj
        .element(tags::COMMAND_FIELD)
        .map_err(|_| ReceiverError::Protocol("命令集缺少Command Field".to_string()))?
        .uint16()
        .map_err(|_| ReceiverError::Protocol("Command Field不是整数".to_string()))?;

    // 响应用MessageIDBeingRespondedTo，请求用MessageID
    let message_id = match obj.element(tags::MESSAGE_ID) {
        Ok(element) => element
            .uint16()
            .map_err(|_| ReceiverError::Protocol("Message ID不是整数".to_string()))?,
        Err(_) => obj
            .element(tags::MESSAGE_ID_BEING_RESPONDED_TO)
            .map_err(|_| ReceiverError::Protocol("命令集缺少Message ID".to_string()))?
            .uint16()
            .map_err(|_| ReceiverError::Protocol("Message ID不是整数".to_string()))?,
    };

    let data_set_type = obj
        .element(tags::COMMAND_DATA_SET_TYPE)
        .map_err(|_| ReceiverError::Protocol("命令集缺少Data Set Type".to_string()))?
        .uint16()
        .map_err(|_| ReceiverError::Protocol("Data Set Type不是整数".to_string()))?;

    let affected_sop_class_uid = read_uid_element(&obj, tags::AFFECTED_SOP_CLASS_UID);
    let affected_sop_instance_uid = read_uid_element(&obj, tags::AFFECTED_SOP_INSTANCE_UID);
    let status = obj
        .element(tags::STATUS)
        .ok()
        .and_then(|e| e.uint16().ok());

    Ok(CommandSet {
        command_field,
        message_id,
        affected_sop_class_uid,
        affected_sop_instance_uid,
        status,
        has_data_set: data_set_type != NO_DATA_SET,
    })
}

fn read_uid_element(
    obj: &InMemDicomObject<StandardDataDictionary>,
    tag: dicom_core::Tag,
) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| utils::trim_uid(&s).to_string())
        .filter(|s| !s.is_empty())
}

fn write_command(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<Vec<u8>> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut out = Vec::new();
    obj.write_dataset_with_ts(&mut out, &ts)
        .map_err(|e| ReceiverError::Protocol(format!("命令集编码失败: {}", e)))?;
    Ok(out)
}

/// 构造C-ECHO-RSP
pub fn build_cecho_rsp(message_id: u16) -> Result<Vec<u8>> {
    let obj = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status::SUCCESS])),
    ]);
    write_command(&obj)
}

/// 构造C-STORE-RSP
pub fn build_cstore_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    rsp_status: u16,
) -> Result<Vec<u8>> {
    let obj = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [rsp_status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ]);
    write_command(&obj)
}

/// 构造C-ECHO-RQ（SCU侧，用于连通性验证）
pub fn build_cecho_rq(message_id: u16) -> Result<Vec<u8>> {
    let obj = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, crate::transfer_syntax::VERIFICATION_SOP_CLASS),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
    ]);
    write_command(&obj)
}

/// 构造C-STORE-RQ（SCU侧）
pub fn build_cstore_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> Result<Vec<u8>> {
    let obj = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ]);
    write_command(&obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cecho_rq_round_trip() {
        let bytes = build_cecho_rq(7).unwrap();
        let cmd = parse_command(&bytes).unwrap();
        assert_eq!(cmd.command_field, C_ECHO_RQ);
        assert_eq!(cmd.message_id, 7);
        assert!(!cmd.has_data_set);
    }

    #[test]
    fn test_cstore_rq_carries_uids_and_dataset_flag() {
        let bytes = build_cstore_rq(42, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4").unwrap();
        let cmd = parse_command(&bytes).unwrap();
        assert_eq!(cmd.command_field, C_STORE_RQ);
        assert_eq!(cmd.message_id, 42);
        assert_eq!(
            cmd.affected_sop_class_uid.as_deref(),
            Some("1.2.840.10008.5.1.4.1.1.2")
        );
        assert_eq!(cmd.affected_sop_instance_uid.as_deref(), Some("1.2.3.4"));
        assert!(cmd.has_data_set);
    }

    #[test]
    fn test_cstore_rsp_status() {
        let bytes =
            build_cstore_rsp(42, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4", status::WARNING_COERCION)
                .unwrap();
        let cmd = parse_command(&bytes).unwrap();
        assert_eq!(cmd.command_field, C_STORE_RSP);
        assert_eq!(cmd.message_id, 42);
        assert_eq!(cmd.status, Some(status::WARNING_COERCION));
        assert!(!cmd.has_data_set);
    }

    #[test]
    fn test_garbage_bytes_are_rejected() {
        assert!(parse_command(&[0xff; 16]).is_err());
    }
}
