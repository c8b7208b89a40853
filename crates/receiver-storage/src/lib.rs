//! # Receiver Storage
//!
//! 影像对象的文件系统存储：内容寻址路径、原子落盘和SHA-256校验。

pub mod store;

pub use store::{sha256_hex, ObjectStore};
