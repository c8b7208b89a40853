//! # Receiver Core
//!
//! DICOM接收服务的核心模块，提供基础数据结构、错误定义、
//! AE注册表接口和通用工具。

pub mod error;
pub mod models;
pub mod registry;
pub mod utils;

pub use error::{ReceiverError, Result};
pub use models::*;
pub use registry::{FacilityRegistry, StaticFacilityRegistry};
