//! DICOM存储服务器
//!
//! 监听循环每接受一个连接就派生一个关联任务，任务间不共享可变
//! 状态。准入控制用信号量实现：超限的连接仍会读完A-ASSOCIATE-RQ，
//! 再以暂时拒绝回应，而不是粗暴断开。

use crate::association::{negotiate, AssociationContext, AssociationState, NegotiationOutcome};
use crate::decoder::decode_dataset;
use crate::dimse::{self, status, CommandSet};
use crate::pdu::{AssociateRj, Pdu, PduCodec, Pdv};
use crate::security::SourceGuard;
use crate::services::{dimse_status_for, StoreService};
use futures::{SinkExt, StreamExt};
use receiver_core::{utils, FacilityRegistry, ReceiverError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// DICOM服务器配置
#[derive(Debug, Clone)]
pub struct DicomServerConfig {
    pub ae_title: String,           // 本端AE标题
    pub bind_addr: String,          // 监听地址
    pub port: u16,                  // 监听端口
    pub max_associations: usize,    // 最大并发关联数
    pub idle_timeout: Duration,     // 关联空闲超时
    pub shutdown_grace: Duration,   // 优雅停机宽限
    pub max_pdu_length: u32,        // 单个PDU上限
    pub max_object_bytes: usize,    // 单个对象上限
    pub max_failed_attempts: u32,   // 窗口内协商失败上限
    pub failure_window: Duration,   // 失败计数窗口
    pub block_duration: Duration,   // 来源封禁时长
}

impl Default for DicomServerConfig {
    fn default() -> Self {
        Self {
            ae_title: "STORE_SCP".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            port: 11112,
            max_associations: 32,
            idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            max_pdu_length: 262_144,
            max_object_bytes: 1024 * 1024 * 1024,
            max_failed_attempts: 5,
            failure_window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
        }
    }
}

/// DICOM存储服务器
pub struct DicomServer {
    config: DicomServerConfig,
    registry: Arc<dyn FacilityRegistry>,
    store: Arc<dyn StoreService>,
    permits: Arc<Semaphore>,
    guard: Arc<SourceGuard>,
    listener: TcpListener,
}

impl DicomServer {
    /// 绑定监听端口
    ///
    /// 绑定失败（端口被占用等）直接返回错误，由上层决定退出。
    pub async fn bind(
        config: DicomServerConfig,
        registry: Arc<dyn FacilityRegistry>,
        store: Arc<dyn StoreService>,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
        let permits = Arc::new(Semaphore::new(config.max_associations));
        let guard = Arc::new(SourceGuard::new(
            config.max_failed_attempts,
            config.failure_window,
            config.block_duration,
        ));
        Ok(Self {
            config,
            registry,
            store,
            permits,
            guard,
            listener,
        })
    }

    /// 实际监听地址（端口传0时由系统分配）
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 运行接受循环直至收到停机信号
    ///
    /// 收到信号后不再接受新连接，在途关联在宽限期内继续跑完，
    /// 超期则强制中止。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "DICOM服务启动: AE={}, 地址={}, 最大关联数={}",
            self.config.ae_title,
            self.local_addr()?,
            self.config.max_associations
        );

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        while tasks.try_join_next().is_some() {}
                        let permit = Arc::clone(&self.permits).try_acquire_owned().ok();
                        let handler = AssociationHandler {
                            config: self.config.clone(),
                            registry: Arc::clone(&self.registry),
                            store: Arc::clone(&self.store),
                            guard: Arc::clone(&self.guard),
                        };
                        tasks.spawn(async move {
                            if let Err(e) = handler.handle(stream, remote, permit).await {
                                warn!("关联异常结束: {}: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => error!("接受连接失败: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("停止接受新连接，等待{}个在途关联", tasks.len());
        let grace = self.config.shutdown_grace;
        let drained = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("优雅停机超时，强制中止剩余关联");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("DICOM服务已停止");
        Ok(())
    }
}

enum Incoming {
    Pdu(Pdu),
    Closed,
    TimedOut,
}

/// 进行中的C-STORE：命令已到，数据集分片陆续到达
struct PendingStore {
    command: CommandSet,
    presentation_context_id: u8,
    buffer: Vec<u8>,
    oversized: bool,
}

struct AssociationHandler {
    config: DicomServerConfig,
    registry: Arc<dyn FacilityRegistry>,
    store: Arc<dyn StoreService>,
    guard: Arc<SourceGuard>,
}

impl AssociationHandler {
    async fn handle(
        self,
        stream: TcpStream,
        remote: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<()> {
        debug!("新连接: {}", remote);
        let mut framed = Framed::new(stream, PduCodec::new(self.config.max_pdu_length));

        let rq = match self.next_pdu(&mut framed).await {
            Ok(Incoming::Pdu(Pdu::AssociateRq(rq))) => rq,
            Ok(Incoming::Pdu(Pdu::Abort { .. })) | Ok(Incoming::Closed) => return Ok(()),
            Ok(Incoming::TimedOut) => {
                framed.send(Pdu::Abort { source: 2, reason: 0 }).await.ok();
                return Ok(());
            }
            Ok(Incoming::Pdu(_)) => {
                framed.send(Pdu::Abort { source: 2, reason: 2 }).await.ok();
                return Err(ReceiverError::Protocol(
                    "协商前收到非关联请求PDU".to_string(),
                ));
            }
            // 畸形PDU：中止而不是静默断开
            Err(e) => {
                framed.send(Pdu::Abort { source: 2, reason: 0 }).await.ok();
                return Err(e);
            }
        };

        // 超限连接也要先读完RQ再拒绝，让对端拿到明确的暂时拒绝原因
        let _permit = match permit {
            Some(p) => p,
            None => {
                info!(
                    "并发关联达到上限，暂时拒绝: calling={}, remote={}",
                    rq.calling_ae_title, remote
                );
                framed
                    .send(Pdu::AssociateRj(AssociateRj::local_limit_exceeded()))
                    .await?;
                return Ok(());
            }
        };

        // 封禁期内的来源在协商前直接拒绝，不触发注册表查询
        if self.guard.is_blocked(remote.ip()) {
            info!(
                "来源处于封禁期，暂时拒绝: calling={}, remote={}",
                rq.calling_ae_title, remote
            );
            framed
                .send(Pdu::AssociateRj(AssociateRj::source_blocked()))
                .await?;
            return Ok(());
        }

        // 注册表不可用时拒绝而非放行
        let called = utils::trim_ae_title(&rq.called_ae_title).to_string();
        let facility = match self.registry.lookup(&called).await {
            Ok(f) => f,
            Err(e) => {
                warn!("注册表查询失败，暂时拒绝关联: {}", e);
                framed
                    .send(Pdu::AssociateRj(AssociateRj::registry_unavailable()))
                    .await?;
                return Ok(());
            }
        };

        let (ac, context) = match negotiate(&rq, facility, self.config.max_pdu_length) {
            NegotiationOutcome::Accepted(boxed) => {
                self.guard.record_success(remote.ip());
                *boxed
            }
            NegotiationOutcome::Rejected { rj, reason } => {
                info!(
                    "拒绝关联: calling={}, remote={}, {}",
                    rq.calling_ae_title, remote, reason
                );
                self.guard.record_failure(remote.ip());
                framed.send(Pdu::AssociateRj(rj)).await?;
                return Ok(());
            }
        };

        info!(
            "关联建立: calling={}, 机构={}, 上下文数={}",
            context.calling_ae_title,
            context.facility.name,
            context.accepted.len()
        );
        framed.send(Pdu::AssociateAc(ac)).await?;

        let final_state = self.data_loop(&mut framed, &context, remote).await?;
        debug!(
            "关联结束: calling={}, 最终状态={:?}",
            context.calling_ae_title, final_state
        );
        Ok(())
    }

    async fn next_pdu(&self, framed: &mut Framed<TcpStream, PduCodec>) -> Result<Incoming> {
        match timeout(self.config.idle_timeout, framed.next()).await {
            Ok(Some(Ok(pdu))) => Ok(Incoming::Pdu(pdu)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(Incoming::Closed),
            Err(_) => Ok(Incoming::TimedOut),
        }
    }

    async fn data_loop(
        &self,
        framed: &mut Framed<TcpStream, PduCodec>,
        context: &AssociationContext,
        remote: SocketAddr,
    ) -> Result<AssociationState> {
        let mut pending: Option<PendingStore> = None;

        loop {
            // 畸形PDU同样走中止路径，对端能观察到A-ABORT而不是裸断连
            let incoming = match self.next_pdu(framed).await {
                Ok(incoming) => incoming,
                Err(e) => {
                    framed.send(Pdu::Abort { source: 2, reason: 0 }).await.ok();
                    return Err(e);
                }
            };
            match incoming {
                Incoming::Pdu(Pdu::PData(pdvs)) => {
                    for pdv in pdvs {
                        if let Some(response) =
                            self.handle_pdv(pdv, context, &mut pending).await?
                        {
                            framed.send(response).await?;
                        }
                    }
                }
                Incoming::Pdu(Pdu::ReleaseRq) => {
                    framed.send(Pdu::ReleaseRp).await?;
                    info!("关联释放: calling={}", context.calling_ae_title);
                    return Ok(AssociationState::Released);
                }
                Incoming::Pdu(Pdu::Abort { source, reason }) => {
                    warn!(
                        "对端中止关联: calling={}, source={}, reason={}",
                        context.calling_ae_title, source, reason
                    );
                    return Ok(AssociationState::Aborted);
                }
                Incoming::Pdu(_) => {
                    framed.send(Pdu::Abort { source: 2, reason: 2 }).await.ok();
                    return Err(ReceiverError::Protocol(
                        "数据阶段收到意外的协商PDU".to_string(),
                    ));
                }
                Incoming::Closed => {
                    warn!("对端未释放即断开: {}", remote);
                    return Ok(AssociationState::Aborted);
                }
                Incoming::TimedOut => {
                    warn!(
                        "关联空闲超时，中止: calling={}, remote={}",
                        context.calling_ae_title, remote
                    );
                    framed.send(Pdu::Abort { source: 2, reason: 0 }).await.ok();
                    return Ok(AssociationState::Aborted);
                }
            }
        }
    }

    async fn handle_pdv(
        &self,
        pdv: Pdv,
        context: &AssociationContext,
        pending: &mut Option<PendingStore>,
    ) -> Result<Option<Pdu>> {
        if pdv.is_command {
            if !pdv.is_last {
                return Err(ReceiverError::Protocol(
                    "不支持分片传输的命令PDV".to_string(),
                ));
            }
            let cmd = dimse::parse_command(&pdv.data)?;
            match cmd.command_field {
                dimse::C_ECHO_RQ => {
                    debug!("C-ECHO: message_id={}", cmd.message_id);
                    let rsp = dimse::build_cecho_rsp(cmd.message_id)?;
                    Ok(Some(command_pdu(pdv.presentation_context_id, rsp)))
                }
                dimse::C_STORE_RQ => {
                    *pending = Some(PendingStore {
                        command: cmd,
                        presentation_context_id: pdv.presentation_context_id,
                        buffer: Vec::new(),
                        oversized: false,
                    });
                    Ok(None)
                }
                other => Err(ReceiverError::Protocol(format!(
                    "不支持的DIMSE命令: 0x{:04x}",
                    other
                ))),
            }
        } else {
            let is_last = pdv.is_last;
            {
                let state = pending.as_mut().ok_or_else(|| {
                    ReceiverError::Protocol("收到无命令前导的数据PDV".to_string())
                })?;
                if state.presentation_context_id != pdv.presentation_context_id {
                    return Err(ReceiverError::Protocol(
                        "数据PDV的表示上下文与命令不一致".to_string(),
                    ));
                }
                if state.buffer.len() + pdv.data.len() > self.config.max_object_bytes {
                    // 超限后继续消费分片直到last，但不再缓存
                    state.oversized = true;
                    state.buffer.clear();
                }
                if !state.oversized {
                    state.buffer.extend_from_slice(&pdv.data);
                }
            }
            if !is_last {
                return Ok(None);
            }
            let state = pending.take().ok_or_else(|| {
                ReceiverError::Protocol("收到无命令前导的数据PDV".to_string())
            })?;
            let response = self.complete_store(state, context).await?;
            Ok(Some(response))
        }
    }

    /// 数据集最后一个分片到达后执行入库并生成C-STORE-RSP
    async fn complete_store(
        &self,
        state: PendingStore,
        context: &AssociationContext,
    ) -> Result<Pdu> {
        let cmd = state.command;
        let pc_id = state.presentation_context_id;
        let sop_class = cmd.affected_sop_class_uid.clone().unwrap_or_default();
        let sop_instance = cmd.affected_sop_instance_uid.clone().unwrap_or_default();

        // 未接受的上下文只让这一个请求失败，关联继续
        let accepted = match context.accepted.get(&pc_id) {
            Some(pc) => pc,
            None => {
                warn!("数据到达未接受的表示上下文: pc_id={}", pc_id);
                let rsp = dimse::build_cstore_rsp(
                    cmd.message_id,
                    &sop_class,
                    &sop_instance,
                    status::CANNOT_UNDERSTAND,
                )?;
                return Ok(command_pdu(pc_id, rsp));
            }
        };

        if state.oversized {
            warn!("对象超过大小上限，拒绝: sop={}", sop_instance);
            let rsp = dimse::build_cstore_rsp(
                cmd.message_id,
                &sop_class,
                &sop_instance,
                status::OUT_OF_RESOURCES,
            )?;
            return Ok(command_pdu(pc_id, rsp));
        }

        // 命令声明的SOP类必须与该上下文协商的抽象语法一致
        if sop_class != accepted.abstract_syntax {
            warn!(
                "SOP类与表示上下文不符: 命令={}, 协商={}",
                sop_class, accepted.abstract_syntax
            );
            let rsp = dimse::build_cstore_rsp(
                cmd.message_id,
                &sop_class,
                &sop_instance,
                status::SOP_CLASS_NOT_SUPPORTED,
            )?;
            return Ok(command_pdu(pc_id, rsp));
        }

        let decoded = match decode_dataset(state.buffer, &accepted.transfer_syntax) {
            Ok(d) => d,
            Err(e) => {
                warn!("数据集解码失败: sop={}, {}", sop_instance, e);
                let rsp = dimse::build_cstore_rsp(
                    cmd.message_id,
                    &sop_class,
                    &sop_instance,
                    status::CANNOT_UNDERSTAND,
                )?;
                return Ok(command_pdu(pc_id, rsp));
            }
        };

        let result = self.store.ingest(decoded, &context.facility).await;
        if result.is_success() {
            info!(
                "对象入库: sop={}, 状态={:?}, 机构={}",
                sop_instance, result.status, context.facility.ae_title
            );
        } else if result.status == receiver_core::IngestionStatus::Conflict {
            warn!("对象内容冲突: sop={}, {}", sop_instance, result.message);
        } else {
            warn!("对象入库失败: sop={}, {}", sop_instance, result.message);
        }

        let rsp = dimse::build_cstore_rsp(
            cmd.message_id,
            &sop_class,
            &sop_instance,
            dimse_status_for(&result),
        )?;
        Ok(command_pdu(pc_id, rsp))
    }
}

fn command_pdu(presentation_context_id: u8, data: Vec<u8>) -> Pdu {
    Pdu::PData(vec![Pdv {
        presentation_context_id,
        is_command: true,
        is_last: true,
        data,
    }])
}
