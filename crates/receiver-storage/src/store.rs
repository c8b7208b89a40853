//! 影像对象存储
//!
//! 以检查/序列/实例UID为路径段的内容寻址存储。字节必须与接收时
//! 完全一致地落盘：先写临时文件并fsync，再以硬链接发布到最终路径，
//! 保证元数据事务开始前字节已持久化，且先到者字节不会被覆盖。

use receiver_core::{ReceiverError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

// 临时文件序号，保证并发写同一目标时临时路径不冲突
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// 计算数据的SHA-256十六进制摘要
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// 对象存储管理器
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 存储根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 实例的规范相对路径: <study_uid>/<series_uid>/<sop_uid>.dcm
    pub fn instance_path(&self, study_uid: &str, series_uid: &str, sop_uid: &str) -> PathBuf {
        PathBuf::from(sanitize_segment(study_uid))
            .join(sanitize_segment(series_uid))
            .join(format!("{}.dcm", sanitize_segment(sop_uid)))
    }

    /// 冲突副本的消歧路径: <study_uid>/<series_uid>/<sop_uid>.conflict-<校验和前8位>.dcm
    pub fn conflict_path(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        checksum: &str,
    ) -> PathBuf {
        let prefix = &checksum[..checksum.len().min(8)];
        PathBuf::from(sanitize_segment(study_uid))
            .join(sanitize_segment(series_uid))
            .join(format!(
                "{}.conflict-{}.dcm",
                sanitize_segment(sop_uid),
                prefix
            ))
    }

    /// 持久化对象字节到相对路径
    ///
    /// 写入临时文件并fsync后以硬链接发布到最终路径。硬链接在目标
    /// 已存在时原子失败，先落盘的字节永远不会被后来者覆盖；此时
    /// 视为幂等成功。返回最终绝对路径的字符串形式。
    pub async fn write(&self, relative: &Path, data: &[u8]) -> Result<String> {
        let final_path = self.root.join(relative);
        let parent = final_path
            .parent()
            .ok_or_else(|| ReceiverError::Storage("存储路径缺少父目录".to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = final_path.with_extension(format!("part{}", seq));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, data).await?;
        file.sync_all().await?;
        drop(file);

        let link_result = tokio::fs::hard_link(&tmp_path, &final_path).await;
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            warn!("临时文件清理失败: {:?}: {}", tmp_path, cleanup);
        }
        match link_result {
            Ok(()) => {
                debug!("对象已落盘: {:?} ({} bytes)", final_path, data.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("目标已存在，保留先到者字节: {:?}", final_path);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(final_path.to_string_lossy().to_string())
    }

    /// 按相对路径读回对象字节
    pub async fn read(&self, relative: &Path) -> Result<Vec<u8>> {
        let full_path = self.root.join(relative);
        let data = tokio::fs::read(full_path).await?;
        Ok(data)
    }

    /// 检查相对路径是否已存在
    pub async fn exists(&self, relative: &Path) -> bool {
        tokio::fs::try_exists(self.root.join(relative))
            .await
            .unwrap_or(false)
    }
}

/// 清洗UID用作路径段
///
/// 合法UID只含数字和点号；其余字符一律替换，防止路径逃逸。
fn sanitize_segment(uid: &str) -> String {
    let cleaned: String = uid
        .chars()
        .map(|c| {
            if c.is_ascii_digit() || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    // 单独的"."或".."不允许作为路径段
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
