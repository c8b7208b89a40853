//! 通用工具函数

/// 验证DICOM UID格式
///
/// 仅允许数字和点号，长度不超过64，且各分量非空。
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    if !uid.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return false;
    }
    uid.split('.').all(|component| !component.is_empty())
}

/// 规范化UI类型元素值
///
/// UI值按偶数长度用NUL填充传输，入库前去除尾部填充。
pub fn trim_uid(raw: &str) -> &str {
    raw.trim_end_matches('\0').trim()
}

/// 规范化AE标题
///
/// 线上AE标题为16字节空格填充的ASCII，去除两侧填充后用于注册表匹配。
/// 匹配本身区分大小写。
pub fn trim_ae_title(raw: &str) -> &str {
    raw.trim()
}
