//! # Receiver Ingest
//!
//! 把协议层解码出的对象持久化为"字节 + 元数据"的入库流水线，
//! 负责幂等、冲突消歧和失败状态归类。

pub mod pipeline;

pub use pipeline::IngestionPipeline;
