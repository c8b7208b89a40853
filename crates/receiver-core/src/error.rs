//! 错误定义模块

use thiserror::Error;

/// 接收服务统一错误类型
///
/// 按错误类别划分：协商错误不产生任何副作用；协议/解码错误只影响单个请求；
/// 存储/数据库错误只影响单个请求且不留下引用不完整字节的元数据记录；
/// 容量错误在关联层面拒绝。
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("关联协商被拒绝: {0}")]
    Negotiation(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("DICOM解码错误: {0}")]
    Decode(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("AE注册表不可用: {0}")]
    Registry(String),

    #[error("容量超限: {0}")]
    Capacity(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// 接收服务统一结果类型
pub type Result<T> = std::result::Result<T, ReceiverError>;
