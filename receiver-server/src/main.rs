//! DICOM存储接收服务入口
//!
//! 监听DICOM上层协议端口，接收C-STORE对象并写入存储与元数据库。

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use receiver_core::{FacilityRegistry, StaticFacilityRegistry};
use receiver_database::{
    schema, DatabasePool, InMemoryMetadataStore, MetadataStore, PgFacilityRegistry,
    PgMetadataStore,
};
use receiver_dicom::{DicomServer, DicomServerConfig, StoreService};
use receiver_ingest::IngestionPipeline;
use receiver_storage::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ReceiverConfig;

#[derive(Parser, Debug)]
#[command(name = "receiver-server")]
#[command(about = "DICOM存储接收服务 (Storage SCP)")]
struct Args {
    /// DICOM监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 本地AE标题
    #[arg(short, long)]
    ae_title: Option<String>,

    /// 影像存储目录
    #[arg(short, long)]
    storage_dir: Option<String>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut config = ReceiverConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.dicom.port = port;
    }
    if let Some(ae_title) = args.ae_title {
        config.dicom.ae_title = ae_title;
    }
    if let Some(storage_dir) = args.storage_dir {
        config.storage.root_path = storage_dir;
    }

    info!("DICOM存储接收服务启动");
    info!("  AE标题: {}", config.dicom.ae_title);
    info!("  监听: {}:{}", config.dicom.host, config.dicom.port);
    info!("  存储目录: {}", config.storage.root_path);
    info!("  最大并发关联: {}", config.dicom.max_associations);

    tokio::fs::create_dir_all(&config.storage.root_path)
        .await
        .with_context(|| format!("存储目录创建失败: {}", config.storage.root_path))?;

    let (registry, metadata): (Arc<dyn FacilityRegistry>, Arc<dyn MetadataStore>) =
        if config.database.enabled {
            info!("使用PostgreSQL后端");
            let pool = DatabasePool::connect(&config.database.url, config.database.max_connections)
                .await
                .context("数据库连接失败")?;
            schema::create_tables(&pool)
                .await
                .context("数据库表初始化失败")?;
            (
                Arc::new(PgFacilityRegistry::new(pool.clone())),
                Arc::new(PgMetadataStore::new(pool)),
            )
        } else {
            info!("使用内存后端");
            let facilities = match &config.registry.allow_list_path {
                Some(path) => {
                    let facilities = config::load_allow_list(path).await?;
                    info!("允许列表已加载: {} 个机构, 来自 {}", facilities.len(), path);
                    facilities
                }
                None => {
                    warn!("未配置允许列表，所有关联请求都会被拒绝");
                    Vec::new()
                }
            };
            let static_registry = Arc::new(StaticFacilityRegistry::new(facilities));

            // 允许列表定期重载，管理端的增删改无需重启即可生效
            if let Some(path) = config.registry.allow_list_path.clone() {
                let registry = Arc::clone(&static_registry);
                let interval = Duration::from_secs(config.registry.reload_interval_secs);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    // 首次tick立即返回，启动时已加载过
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        match config::load_allow_list(&path).await {
                            Ok(facilities) => {
                                info!("允许列表已重载: {} 个机构", facilities.len());
                                registry.replace(facilities).await;
                            }
                            // 重载失败保留上一份条目
                            Err(e) => warn!("允许列表重载失败: {}", e),
                        }
                    }
                });
            }

            (static_registry, Arc::new(InMemoryMetadataStore::new()))
        };

    let pipeline: Arc<dyn StoreService> = Arc::new(IngestionPipeline::new(
        ObjectStore::new(&config.storage.root_path),
        metadata,
    ));

    let server_config = DicomServerConfig {
        ae_title: config.dicom.ae_title.clone(),
        bind_addr: config.dicom.host.clone(),
        port: config.dicom.port,
        max_associations: config.dicom.max_associations,
        idle_timeout: Duration::from_secs(config.dicom.idle_timeout_secs),
        shutdown_grace: Duration::from_secs(config.dicom.shutdown_grace_secs),
        max_pdu_length: config.dicom.max_pdu_length,
        max_object_bytes: config.dicom.max_object_bytes,
        max_failed_attempts: config.dicom.max_failed_attempts,
        failure_window: Duration::from_secs(config.dicom.failure_window_secs),
        block_duration: Duration::from_secs(config.dicom.block_duration_secs),
    };
    let server = DicomServer::bind(server_config, registry, pipeline)
        .await
        .with_context(|| {
            format!(
                "监听失败: {}:{}",
                config.dicom.host, config.dicom.port
            )
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("收到停机信号，开始优雅停机");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("停机信号监听失败: {}", e),
        }
    });

    server.run(shutdown_rx).await?;
    info!("服务已退出");
    Ok(())
}
