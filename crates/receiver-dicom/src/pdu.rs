//! DICOM上层协议PDU编解码
//!
//! 实现PS3.8定义的七种PDU的线上格式。头部固定6字节：
//! 类型(1) + 保留(1) + 负载长度(4, 大端)。负载长度超过上限的
//! PDU直接判为协议违规，防止恶意长度导致的内存放大。

use bytes::{Buf, BufMut, BytesMut};
use receiver_core::{ReceiverError, Result};
use tokio_util::codec::{Decoder, Encoder};

/// PDU类型码
pub const PDU_TYPE_ASSOCIATE_RQ: u8 = 0x01;
pub const PDU_TYPE_ASSOCIATE_AC: u8 = 0x02;
pub const PDU_TYPE_ASSOCIATE_RJ: u8 = 0x03;
pub const PDU_TYPE_P_DATA_TF: u8 = 0x04;
pub const PDU_TYPE_RELEASE_RQ: u8 = 0x05;
pub const PDU_TYPE_RELEASE_RP: u8 = 0x06;
pub const PDU_TYPE_ABORT: u8 = 0x07;

/// 协商项类型码
const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const ITEM_MAX_PDU_LENGTH: u8 = 0x51;
const ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const ITEM_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;

const PDU_HEADER_LEN: usize = 6;
const PROTOCOL_VERSION: u16 = 1;

/// 本实现的标识，写入User Information项
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.9.7433.1.1";
pub const IMPLEMENTATION_VERSION_NAME: &str = "RECEIVER_0_1";

/// 单个提议的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedPresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// 协商结果中的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    pub id: u8,
    /// 0=接受, 3=抽象语法不支持, 4=传输语法不支持
    pub result: u8,
    pub transfer_syntax: String,
}

/// 表示上下文协商结果码
pub const PC_RESULT_ACCEPTANCE: u8 = 0;
pub const PC_RESULT_ABSTRACT_SYNTAX_NOT_SUPPORTED: u8 = 3;
pub const PC_RESULT_TRANSFER_SYNTAXES_NOT_SUPPORTED: u8 = 4;

/// A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<ProposedPresentationContext>,
    pub max_pdu_length: u32,
}

/// A-ASSOCIATE-AC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub max_pdu_length: u32,
}

/// A-ASSOCIATE-RJ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateRj {
    /// 1=永久拒绝, 2=暂时拒绝
    pub result: u8,
    pub source: u8,
    pub reason: u8,
}

impl AssociateRj {
    /// Called AE未注册：永久拒绝，service-user / called-AE-title-not-recognized
    pub fn called_ae_not_recognized() -> Self {
        Self { result: 1, source: 1, reason: 7 }
    }

    /// 应用上下文不受支持：永久拒绝
    pub fn application_context_not_supported() -> Self {
        Self { result: 1, source: 1, reason: 2 }
    }

    /// 无可接受的表示上下文：永久拒绝，无具体原因码
    pub fn no_acceptable_presentation_context() -> Self {
        Self { result: 1, source: 1, reason: 1 }
    }

    /// 注册表暂时不可用：暂时拒绝，提议方可稍后重试
    pub fn registry_unavailable() -> Self {
        Self { result: 2, source: 3, reason: 1 }
    }

    /// 并发关联数已达上限：暂时拒绝，local-limit-exceeded
    pub fn local_limit_exceeded() -> Self {
        Self { result: 2, source: 3, reason: 2 }
    }

    /// 来源处于封禁期：暂时拒绝，temporary-congestion
    pub fn source_blocked() -> Self {
        Self { result: 2, source: 3, reason: 1 }
    }
}

/// P-DATA-TF中的单个表示数据值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdv {
    pub presentation_context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// 上层协议PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj(AssociateRj),
    PData(Vec<Pdv>),
    ReleaseRq,
    ReleaseRp,
    Abort { source: u8, reason: u8 },
}

/// PDU帧编解码器
///
/// 解码侧在完整PDU到齐前返回`Ok(None)`，由tokio-util负责继续攒包。
pub struct PduCodec {
    max_pdu_length: usize,
}

impl PduCodec {
    pub fn new(max_pdu_length: u32) -> Self {
        Self {
            max_pdu_length: max_pdu_length as usize,
        }
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = ReceiverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pdu>> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }

        let pdu_type = src[0];
        let body_len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if body_len > self.max_pdu_length {
            return Err(ReceiverError::Protocol(format!(
                "PDU长度超限: {} > {}",
                body_len, self.max_pdu_length
            )));
        }
        if src.len() < PDU_HEADER_LEN + body_len {
            src.reserve(PDU_HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(PDU_HEADER_LEN);
        let body = src.split_to(body_len);
        let pdu = parse_pdu(pdu_type, &body)?;
        Ok(Some(pdu))
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = ReceiverError;

    fn encode(&mut self, pdu: Pdu, dst: &mut BytesMut) -> Result<()> {
        let (pdu_type, body) = encode_pdu(&pdu);
        dst.reserve(PDU_HEADER_LEN + body.len());
        dst.put_u8(pdu_type);
        dst.put_u8(0);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

// ========== 解码 ==========

fn parse_pdu(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    match pdu_type {
        PDU_TYPE_ASSOCIATE_RQ => parse_associate(body).map(Pdu::AssociateRq),
        PDU_TYPE_ASSOCIATE_AC => parse_associate_ac(body).map(Pdu::AssociateAc),
        PDU_TYPE_ASSOCIATE_RJ => {
            if body.len() != 4 {
                return Err(protocol_err("A-ASSOCIATE-RJ长度错误"));
            }
            Ok(Pdu::AssociateRj(AssociateRj {
                result: body[1],
                source: body[2],
                reason: body[3],
            }))
        }
        PDU_TYPE_P_DATA_TF => parse_p_data(body).map(Pdu::PData),
        PDU_TYPE_RELEASE_RQ => Ok(Pdu::ReleaseRq),
        PDU_TYPE_RELEASE_RP => Ok(Pdu::ReleaseRp),
        PDU_TYPE_ABORT => {
            if body.len() != 4 {
                return Err(protocol_err("A-ABORT长度错误"));
            }
            Ok(Pdu::Abort {
                source: body[2],
                reason: body[3],
            })
        }
        other => Err(protocol_err(format!("未知PDU类型: 0x{:02x}", other))),
    }
}

fn protocol_err(msg: impl Into<String>) -> ReceiverError {
    ReceiverError::Protocol(msg.into())
}

/// 负载游标，越界读取即协议违规
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(protocol_err("PDU负载被截断"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn read_uid(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

fn read_ae_title(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

struct AssociateHeader {
    called_ae_title: String,
    calling_ae_title: String,
}

fn parse_associate_header(r: &mut Reader<'_>) -> Result<AssociateHeader> {
    let version = r.u16()?;
    if version != PROTOCOL_VERSION {
        return Err(protocol_err(format!("不支持的协议版本: {}", version)));
    }
    r.take(2)?; // 保留
    let called = read_ae_title(r.take(16)?);
    let calling = read_ae_title(r.take(16)?);
    r.take(32)?; // 保留
    Ok(AssociateHeader {
        called_ae_title: called,
        calling_ae_title: calling,
    })
}

fn parse_associate(body: &[u8]) -> Result<AssociateRq> {
    let mut r = Reader::new(body);
    let header = parse_associate_header(&mut r)?;

    let mut application_context = String::new();
    let mut presentation_contexts = Vec::new();
    let mut max_pdu_length = 0u32;

    while r.remaining() > 0 {
        let item_type = r.u8()?;
        r.u8()?; // 保留
        let item_len = r.u16()? as usize;
        let item = r.take(item_len)?;

        match item_type {
            ITEM_APPLICATION_CONTEXT => application_context = read_uid(item),
            ITEM_PRESENTATION_CONTEXT_RQ => {
                presentation_contexts.push(parse_presentation_context_rq(item)?);
            }
            ITEM_USER_INFORMATION => {
                max_pdu_length = parse_user_information(item)?;
            }
            // 其余项（扩展协商等）跳过
            _ => {}
        }
    }

    if application_context.is_empty() {
        return Err(protocol_err("缺少应用上下文项"));
    }
    if presentation_contexts.is_empty() {
        return Err(protocol_err("缺少表示上下文项"));
    }

    Ok(AssociateRq {
        called_ae_title: header.called_ae_title,
        calling_ae_title: header.calling_ae_title,
        application_context,
        presentation_contexts,
        max_pdu_length,
    })
}

fn parse_presentation_context_rq(item: &[u8]) -> Result<ProposedPresentationContext> {
    let mut r = Reader::new(item);
    let id = r.u8()?;
    if id % 2 == 0 {
        return Err(protocol_err(format!("表示上下文ID必须为奇数: {}", id)));
    }
    r.take(3)?; // 保留

    let mut abstract_syntax = String::new();
    let mut transfer_syntaxes = Vec::new();
    while r.remaining() > 0 {
        let sub_type = r.u8()?;
        r.u8()?;
        let sub_len = r.u16()? as usize;
        let sub = r.take(sub_len)?;
        match sub_type {
            ITEM_ABSTRACT_SYNTAX => abstract_syntax = read_uid(sub),
            ITEM_TRANSFER_SYNTAX => transfer_syntaxes.push(read_uid(sub)),
            other => {
                return Err(protocol_err(format!(
                    "表示上下文中出现非法子项: 0x{:02x}",
                    other
                )))
            }
        }
    }

    if abstract_syntax.is_empty() || transfer_syntaxes.is_empty() {
        return Err(protocol_err("表示上下文缺少抽象语法或传输语法"));
    }

    Ok(ProposedPresentationContext {
        id,
        abstract_syntax,
        transfer_syntaxes,
    })
}

fn parse_user_information(item: &[u8]) -> Result<u32> {
    let mut r = Reader::new(item);
    let mut max_pdu_length = 0u32;
    while r.remaining() > 0 {
        let sub_type = r.u8()?;
        r.u8()?;
        let sub_len = r.u16()? as usize;
        let sub = r.take(sub_len)?;
        if sub_type == ITEM_MAX_PDU_LENGTH {
            if sub.len() != 4 {
                return Err(protocol_err("最大PDU长度子项必须为4字节"));
            }
            max_pdu_length = u32::from_be_bytes([sub[0], sub[1], sub[2], sub[3]]);
        }
    }
    Ok(max_pdu_length)
}

fn parse_associate_ac(body: &[u8]) -> Result<AssociateAc> {
    let mut r = Reader::new(body);
    let header = parse_associate_header(&mut r)?;

    let mut application_context = String::new();
    let mut presentation_contexts = Vec::new();
    let mut max_pdu_length = 0u32;

    while r.remaining() > 0 {
        let item_type = r.u8()?;
        r.u8()?;
        let item_len = r.u16()? as usize;
        let item = r.take(item_len)?;

        match item_type {
            ITEM_APPLICATION_CONTEXT => application_context = read_uid(item),
            ITEM_PRESENTATION_CONTEXT_AC => {
                let mut pc = Reader::new(item);
                let id = pc.u8()?;
                pc.u8()?;
                let result = pc.u8()?;
                pc.u8()?;
                let mut transfer_syntax = String::new();
                while pc.remaining() > 0 {
                    let sub_type = pc.u8()?;
                    pc.u8()?;
                    let sub_len = pc.u16()? as usize;
                    let sub = pc.take(sub_len)?;
                    if sub_type == ITEM_TRANSFER_SYNTAX {
                        transfer_syntax = read_uid(sub);
                    }
                }
                presentation_contexts.push(PresentationContextResult {
                    id,
                    result,
                    transfer_syntax,
                });
            }
            ITEM_USER_INFORMATION => {
                max_pdu_length = parse_user_information(item)?;
            }
            _ => {}
        }
    }

    Ok(AssociateAc {
        called_ae_title: header.called_ae_title,
        calling_ae_title: header.calling_ae_title,
        application_context,
        presentation_contexts,
        max_pdu_length,
    })
}

fn parse_p_data(body: &[u8]) -> Result<Vec<Pdv>> {
    let mut r = Reader::new(body);
    let mut pdvs = Vec::new();
    while r.remaining() > 0 {
        let pdv_len = r.u32()? as usize;
        if pdv_len < 2 {
            return Err(protocol_err("PDV长度至少为2字节"));
        }
        let pdv = r.take(pdv_len)?;
        let presentation_context_id = pdv[0];
        let control = pdv[1];
        pdvs.push(Pdv {
            presentation_context_id,
            is_command: control & 0x01 != 0,
            is_last: control & 0x02 != 0,
            data: pdv[2..].to_vec(),
        });
    }
    if pdvs.is_empty() {
        return Err(protocol_err("P-DATA-TF不含任何PDV"));
    }
    Ok(pdvs)
}

// ========== 编码 ==========

fn encode_pdu(pdu: &Pdu) -> (u8, Vec<u8>) {
    match pdu {
        Pdu::AssociateRq(rq) => (PDU_TYPE_ASSOCIATE_RQ, encode_associate_rq(rq)),
        Pdu::AssociateAc(ac) => (PDU_TYPE_ASSOCIATE_AC, encode_associate_ac(ac)),
        Pdu::AssociateRj(rj) => (
            PDU_TYPE_ASSOCIATE_RJ,
            vec![0, rj.result, rj.source, rj.reason],
        ),
        Pdu::PData(pdvs) => (PDU_TYPE_P_DATA_TF, encode_p_data(pdvs)),
        Pdu::ReleaseRq => (PDU_TYPE_RELEASE_RQ, vec![0; 4]),
        Pdu::ReleaseRp => (PDU_TYPE_RELEASE_RP, vec![0; 4]),
        Pdu::Abort { source, reason } => (PDU_TYPE_ABORT, vec![0, 0, *source, *reason]),
    }
}

fn put_ae_title(out: &mut Vec<u8>, ae_title: &str) {
    let mut field = [b' '; 16];
    let bytes = ae_title.as_bytes();
    let n = bytes.len().min(16);
    field[..n].copy_from_slice(&bytes[..n]);
    out.extend_from_slice(&field);
}

fn put_item(out: &mut Vec<u8>, item_type: u8, payload: &[u8]) {
    out.push(item_type);
    out.push(0);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

fn encode_associate_header(out: &mut Vec<u8>, called: &str, calling: &str) {
    out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    out.extend_from_slice(&[0u8; 2]);
    put_ae_title(out, called);
    put_ae_title(out, calling);
    out.extend_from_slice(&[0u8; 32]);
}

fn encode_user_information(out: &mut Vec<u8>, max_pdu_length: u32) {
    let mut ui = Vec::new();
    put_item(&mut ui, ITEM_MAX_PDU_LENGTH, &max_pdu_length.to_be_bytes());
    put_item(
        &mut ui,
        ITEM_IMPLEMENTATION_CLASS_UID,
        IMPLEMENTATION_CLASS_UID.as_bytes(),
    );
    put_item(
        &mut ui,
        ITEM_IMPLEMENTATION_VERSION_NAME,
        IMPLEMENTATION_VERSION_NAME.as_bytes(),
    );
    put_item(out, ITEM_USER_INFORMATION, &ui);
}

fn encode_associate_rq(rq: &AssociateRq) -> Vec<u8> {
    let mut out = Vec::new();
    encode_associate_header(&mut out, &rq.called_ae_title, &rq.calling_ae_title);
    put_item(
        &mut out,
        ITEM_APPLICATION_CONTEXT,
        rq.application_context.as_bytes(),
    );
    for pc in &rq.presentation_contexts {
        let mut body = vec![pc.id, 0, 0, 0];
        put_item(&mut body, ITEM_ABSTRACT_SYNTAX, pc.abstract_syntax.as_bytes());
        for ts in &pc.transfer_syntaxes {
            put_item(&mut body, ITEM_TRANSFER_SYNTAX, ts.as_bytes());
        }
        put_item(&mut out, ITEM_PRESENTATION_CONTEXT_RQ, &body);
    }
    encode_user_information(&mut out, rq.max_pdu_length);
    out
}

fn encode_associate_ac(ac: &AssociateAc) -> Vec<u8> {
    let mut out = Vec::new();
    encode_associate_header(&mut out, &ac.called_ae_title, &ac.calling_ae_title);
    put_item(
        &mut out,
        ITEM_APPLICATION_CONTEXT,
        ac.application_context.as_bytes(),
    );
    for pc in &ac.presentation_contexts {
        let mut body = vec![pc.id, 0, pc.result, 0];
        put_item(&mut body, ITEM_TRANSFER_SYNTAX, pc.transfer_syntax.as_bytes());
        put_item(&mut out, ITEM_PRESENTATION_CONTEXT_AC, &body);
    }
    encode_user_information(&mut out, ac.max_pdu_length);
    out
}

fn encode_p_data(pdvs: &[Pdv]) -> Vec<u8> {
    let mut out = Vec::new();
    for pdv in pdvs {
        out.extend_from_slice(&((pdv.data.len() + 2) as u32).to_be_bytes());
        out.push(pdv.presentation_context_id);
        let mut control = 0u8;
        if pdv.is_command {
            control |= 0x01;
        }
        if pdv.is_last {
            control |= 0x02;
        }
        out.push(control);
        out.extend_from_slice(&pdv.data);
    }
    out
}
