//! 关联协商与状态机
//!
//! 协商本身是纯函数：输入A-ASSOCIATE-RQ和注册表查询结果，输出
//! 接受（AC + 关联上下文）或拒绝（RJ + 原因）。网络I/O全部留在
//! 服务器层，便于单测覆盖每条拒绝路径。

use crate::pdu::{
    AssociateAc, AssociateRj, AssociateRq, PresentationContextResult, PC_RESULT_ACCEPTANCE,
    PC_RESULT_TRANSFER_SYNTAXES_NOT_SUPPORTED,
};
use crate::transfer_syntax;
use receiver_core::Facility;
use std::collections::HashMap;

/// DICOM应用上下文名称，RQ中必须携带该值
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// 关联生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    /// 等待A-ASSOCIATE-RQ
    AwaitingRequest,
    /// 协商完成，可传输数据
    Established,
    /// 双方确认释放，正常结束
    Released,
    /// 任一方中止，未完成的对象作废
    Aborted,
}

/// 已接受的表示上下文
#[derive(Debug, Clone)]
pub struct AcceptedPresentationContext {
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// 协商成功后的关联上下文
///
/// 归属机构在协商时绑定，此后该关联收到的所有对象都记到该机构名下。
#[derive(Debug, Clone)]
pub struct AssociationContext {
    pub facility: Facility,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// 对端声明的最大PDU长度，0表示未声明
    pub peer_max_pdu_length: u32,
    /// 按表示上下文ID索引的已接受上下文
    pub accepted: HashMap<u8, AcceptedPresentationContext>,
}

impl AssociationContext {
    /// 查已接受上下文的传输语法
    pub fn transfer_syntax_for(&self, presentation_context_id: u8) -> Option<&str> {
        self.accepted
            .get(&presentation_context_id)
            .map(|pc| pc.transfer_syntax.as_str())
    }
}

/// 协商结果
#[derive(Debug)]
pub enum NegotiationOutcome {
    Accepted(Box<(AssociateAc, AssociationContext)>),
    Rejected { rj: AssociateRj, reason: String },
}

/// 对A-ASSOCIATE-RQ执行协商
///
/// `facility`为注册表按Called AE Title查询的结果；注册表不可用的
/// 情况由调用方在查询阶段直接以暂时拒绝处理，不会走到这里。
/// 抽象语法不做白名单过滤，只要提议的传输语法中有受支持者即接受，
/// 每个上下文按提议顺序选择第一个受支持的传输语法。
pub fn negotiate(
    rq: &AssociateRq,
    facility: Option<Facility>,
    local_max_pdu_length: u32,
) -> NegotiationOutcome {
    let facility = match facility {
        Some(f) => f,
        None => {
            return NegotiationOutcome::Rejected {
                rj: AssociateRj::called_ae_not_recognized(),
                reason: format!("Called AE未注册: {}", rq.called_ae_title),
            }
        }
    };

    if rq.application_context != APPLICATION_CONTEXT_NAME {
        return NegotiationOutcome::Rejected {
            rj: AssociateRj::application_context_not_supported(),
            reason: format!("应用上下文不支持: {}", rq.application_context),
        };
    }

    let mut results = Vec::with_capacity(rq.presentation_contexts.len());
    let mut accepted = HashMap::new();
    for pc in &rq.presentation_contexts {
        match pc
            .transfer_syntaxes
            .iter()
            .find(|ts| transfer_syntax::is_supported(ts))
        {
            Some(ts) => {
                results.push(PresentationContextResult {
                    id: pc.id,
                    result: PC_RESULT_ACCEPTANCE,
                    transfer_syntax: ts.clone(),
                });
                accepted.insert(
                    pc.id,
                    AcceptedPresentationContext {
                        abstract_syntax: pc.abstract_syntax.clone(),
                        transfer_syntax: ts.clone(),
                    },
                );
            }
            None => {
                results.push(PresentationContextResult {
                    id: pc.id,
                    result: PC_RESULT_TRANSFER_SYNTAXES_NOT_SUPPORTED,
                    // 拒绝的上下文回显提议中的第一个传输语法
                    transfer_syntax: pc.transfer_syntaxes[0].clone(),
                });
            }
        }
    }

    // 一个可用上下文都没有的关联没有存在意义，直接拒绝
    if accepted.is_empty() {
        return NegotiationOutcome::Rejected {
            rj: AssociateRj::no_acceptable_presentation_context(),
            reason: "所有表示上下文的传输语法均不支持".to_string(),
        };
    }

    let ac = AssociateAc {
        called_ae_title: rq.called_ae_title.clone(),
        calling_ae_title: rq.calling_ae_title.clone(),
        application_context: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: results,
        max_pdu_length: local_max_pdu_length,
    };
    let context = AssociationContext {
        facility,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        peer_max_pdu_length: rq.max_pdu_length,
        accepted,
    };
    NegotiationOutcome::Accepted(Box::new((ac, context)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::ProposedPresentationContext;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_facility() -> Facility {
        Facility {
            id: Uuid::new_v4(),
            name: "测试机构".to_string(),
            ae_title: "STORE_SCP".to_string(),
            contact_email: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn sample_rq(transfer_syntaxes: Vec<&str>) -> AssociateRq {
        AssociateRq {
            called_ae_title: "STORE_SCP".to_string(),
            calling_ae_title: "CT_SCANNER".to_string(),
            application_context: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![ProposedPresentationContext {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
            }],
            max_pdu_length: 16384,
        }
    }

    #[test]
    fn test_accepts_first_supported_transfer_syntax() {
        // 按提议顺序取第一个受支持者，而不是本地偏好
        let rq = sample_rq(vec![
            "1.2.840.10008.1.2.4.50",
            "1.2.840.10008.1.2.1",
            "1.2.840.10008.1.2",
        ]);
        match negotiate(&rq, Some(sample_facility()), 16384) {
            NegotiationOutcome::Accepted(boxed) => {
                let (ac, ctx) = *boxed;
                assert_eq!(ac.presentation_contexts[0].result, PC_RESULT_ACCEPTANCE);
                assert_eq!(
                    ac.presentation_contexts[0].transfer_syntax,
                    "1.2.840.10008.1.2.1"
                );
                assert_eq!(ctx.transfer_syntax_for(1), Some("1.2.840.10008.1.2.1"));
                assert_eq!(ctx.facility.ae_title, "STORE_SCP");
            }
            NegotiationOutcome::Rejected { reason, .. } => panic!("不应拒绝: {}", reason),
        }
    }

    #[test]
    fn test_unknown_called_ae_is_rejected_permanently() {
        let rq = sample_rq(vec!["1.2.840.10008.1.2"]);
        match negotiate(&rq, None, 16384) {
            NegotiationOutcome::Rejected { rj, .. } => {
                assert_eq!(rj, AssociateRj::called_ae_not_recognized());
                assert_eq!(rj.result, 1);
                assert_eq!(rj.source, 1);
                assert_eq!(rj.reason, 7);
            }
            NegotiationOutcome::Accepted(_) => panic!("未注册AE不应被接受"),
        }
    }

    #[test]
    fn test_wrong_application_context_is_rejected() {
        let mut rq = sample_rq(vec!["1.2.840.10008.1.2"]);
        rq.application_context = "1.2.3.4".to_string();
        match negotiate(&rq, Some(sample_facility()), 16384) {
            NegotiationOutcome::Rejected { rj, .. } => {
                assert_eq!(rj, AssociateRj::application_context_not_supported());
            }
            NegotiationOutcome::Accepted(_) => panic!("错误应用上下文不应被接受"),
        }
    }

    #[test]
    fn test_all_compressed_syntaxes_rejects_association() {
        let rq = sample_rq(vec!["1.2.840.10008.1.2.4.50", "1.2.840.10008.1.2.4.70"]);
        match negotiate(&rq, Some(sample_facility()), 16384) {
            NegotiationOutcome::Rejected { rj, .. } => {
                assert_eq!(rj, AssociateRj::no_acceptable_presentation_context());
            }
            NegotiationOutcome::Accepted(_) => panic!("无可用传输语法不应被接受"),
        }
    }

    #[test]
    fn test_mixed_contexts_reject_only_unsupported() {
        let mut rq = sample_rq(vec!["1.2.840.10008.1.2"]);
        rq.presentation_contexts.push(ProposedPresentationContext {
            id: 3,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.4".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2.4.50".to_string()],
        });
        match negotiate(&rq, Some(sample_facility()), 16384) {
            NegotiationOutcome::Accepted(boxed) => {
                let (ac, ctx) = *boxed;
                assert_eq!(ac.presentation_contexts.len(), 2);
                assert_eq!(ac.presentation_contexts[0].result, PC_RESULT_ACCEPTANCE);
                assert_eq!(
                    ac.presentation_contexts[1].result,
                    PC_RESULT_TRANSFER_SYNTAXES_NOT_SUPPORTED
                );
                assert!(ctx.transfer_syntax_for(3).is_none());
            }
            NegotiationOutcome::Rejected { reason, .. } => panic!("不应整体拒绝: {}", reason),
        }
    }
}
