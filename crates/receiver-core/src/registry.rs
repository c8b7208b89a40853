//! 机构/AE注册表
//!
//! 关联协商时按Called AE Title查询授权机构。只读路径，每个关联只查询一次，
//! 避免高吞吐下的查询放大。查询失败时必须拒绝关联（fail closed），
//! 绝不默认放行。

use crate::{Facility, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// AE注册表查询能力
///
/// 以注入的只读接口建模而非进程级单例，便于测试时替换为内存实现。
#[async_trait]
pub trait FacilityRegistry: Send + Sync {
    /// 按Called AE Title精确查询（区分大小写）
    ///
    /// 返回`Ok(None)`表示AE未注册或已停用；返回`Err`表示注册表不可用，
    /// 调用方必须拒绝关联。
    async fn lookup(&self, called_ae_title: &str) -> Result<Option<Facility>>;
}

/// 内存AE注册表
///
/// 运行时可从允许列表文件加载，测试时直接用条目构造。
pub struct StaticFacilityRegistry {
    facilities: RwLock<HashMap<String, Facility>>,
}

impl StaticFacilityRegistry {
    /// 用机构列表构造注册表，键为AE标题原文
    pub fn new(facilities: Vec<Facility>) -> Self {
        let map = facilities
            .into_iter()
            .map(|f| (f.ae_title.clone(), f))
            .collect();
        Self {
            facilities: RwLock::new(map),
        }
    }

    /// 替换全部条目（允许列表文件重新加载时使用）
    pub async fn replace(&self, facilities: Vec<Facility>) {
        let mut map = self.facilities.write().await;
        map.clear();
        for facility in facilities {
            map.insert(facility.ae_title.clone(), facility);
        }
        debug!("AE注册表已刷新: {} 个机构", map.len());
    }

    pub async fn len(&self) -> usize {
        self.facilities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.facilities.read().await.is_empty()
    }
}

#[async_trait]
impl FacilityRegistry for StaticFacilityRegistry {
    async fn lookup(&self, called_ae_title: &str) -> Result<Option<Facility>> {
        let map = self.facilities.read().await;
        Ok(map
            .get(called_ae_title)
            .filter(|f| f.is_active)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn facility(ae_title: &str, active: bool) -> Facility {
        Facility {
            id: Uuid::new_v4(),
            name: format!("机构-{}", ae_title),
            ae_title: ae_title.to_string(),
            contact_email: None,
            is_active: active,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_lookup_exact_match() {
        let registry = StaticFacilityRegistry::new(vec![facility("ALPHA", true)]);

        assert!(registry.lookup("ALPHA").await.unwrap().is_some());
        // AE标题区分大小写
        assert!(registry.lookup("alpha").await.unwrap().is_none());
        assert!(registry.lookup("BETA").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inactive_facility_not_authorized() {
        let registry = StaticFacilityRegistry::new(vec![facility("GAMMA", false)]);
        assert!(registry.lookup("GAMMA").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_entries() {
        let registry = StaticFacilityRegistry::new(vec![facility("ALPHA", true)]);
        registry.replace(vec![facility("BETA", true)]).await;

        assert!(registry.lookup("ALPHA").await.unwrap().is_none());
        assert!(registry.lookup("BETA").await.unwrap().is_some());
        assert_eq!(registry.len().await, 1);
    }
}
