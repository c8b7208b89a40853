//! # Receiver DICOM
//!
//! DICOM上层协议与DIMSE服务实现：PDU编解码、关联协商状态机、
//! 命令集处理、数据集解码和存储服务器。

pub mod association;
pub mod decoder;
pub mod dimse;
pub mod pdu;
pub mod security;
pub mod server;
pub mod services;
pub mod transfer_syntax;

// 重新导出主要类型
pub use association::{negotiate, AssociationContext, AssociationState, NegotiationOutcome};
pub use decoder::{decode_dataset, DecodedObject};
pub use pdu::{AssociateAc, AssociateRj, AssociateRq, Pdu, PduCodec, Pdv};
pub use security::SourceGuard;
pub use server::{DicomServer, DicomServerConfig};
pub use services::{dimse_status_for, StoreService};
