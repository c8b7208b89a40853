//! 传输语法支持

/// 隐式VR小端（DICOM默认传输语法）
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
/// 显式VR小端
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
/// 显式VR大端（已废弃但线上仍有设备使用）
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Verification SOP Class（C-ECHO）
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// 本服务支持的传输语法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSyntaxKind {
    ImplicitVrLittleEndian,
    ExplicitVrLittleEndian,
    ExplicitVrBigEndian,
}

impl TransferSyntaxKind {
    /// 按UID识别支持的传输语法，压缩语法一律返回None
    pub fn from_uid(uid: &str) -> Option<Self> {
        match uid {
            IMPLICIT_VR_LITTLE_ENDIAN => Some(Self::ImplicitVrLittleEndian),
            EXPLICIT_VR_LITTLE_ENDIAN => Some(Self::ExplicitVrLittleEndian),
            EXPLICIT_VR_BIG_ENDIAN => Some(Self::ExplicitVrBigEndian),
            _ => None,
        }
    }

    pub fn uid(&self) -> &'static str {
        match self {
            Self::ImplicitVrLittleEndian => IMPLICIT_VR_LITTLE_ENDIAN,
            Self::ExplicitVrLittleEndian => EXPLICIT_VR_LITTLE_ENDIAN,
            Self::ExplicitVrBigEndian => EXPLICIT_VR_BIG_ENDIAN,
        }
    }
}

/// 传输语法是否受支持（仅未压缩语法）
pub fn is_supported(uid: &str) -> bool {
    TransferSyntaxKind::from_uid(uid).is_some()
}
