//! # Receiver Database
//!
//! 影像元数据的PostgreSQL存储：连接池、表结构、元数据提交事务
//! 和机构注册表查询，并提供语义一致的内存实现。

pub mod connection;
pub mod metadata;
pub mod models;
pub mod registry;
pub mod schema;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use metadata::{CommitOutcome, InMemoryMetadataStore, MetadataStore, PgMetadataStore};
pub use models::{NewInstanceConflict, NewSopInstance};
pub use registry::PgFacilityRegistry;
