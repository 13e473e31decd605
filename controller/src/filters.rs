//! 过滤器快照缓存
//!
//! Controller 为管理查询维护各节点过滤器的最近快照：
//! 每次成功的过滤器推送/回滚后从 Agent 拉取最新配置刷新缓存，
//! Agent 不可达时管理查询退回缓存数据。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use common::grpc::xbox;

use crate::push::AgentPushClient;

/// 单个节点的过滤器快照
#[derive(Debug, Clone, Serialize)]
pub struct FilterSnapshot {
    pub agent_id: String,
    pub config_version: String,
    pub filters: Vec<xbox::ProtocolFilter>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FilterSnapshotCache {
    snapshots: Arc<RwLock<HashMap<String, FilterSnapshot>>>,
    push: Arc<AgentPushClient>,
}

impl FilterSnapshotCache {
    pub fn new(push: Arc<AgentPushClient>) -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            push,
        }
    }

    /// 缓存的快照
    pub async fn get(&self, agent_id: &str) -> Option<FilterSnapshot> {
        self.snapshots.read().await.get(agent_id).cloned()
    }

    /// 写入快照
    pub async fn store(
        &self,
        agent_id: &str,
        config_version: &str,
        filters: Vec<xbox::ProtocolFilter>,
    ) {
        let snapshot = FilterSnapshot {
            agent_id: agent_id.to_string(),
            config_version: config_version.to_string(),
            filters,
            fetched_at: Utc::now(),
        };
        self.snapshots
            .write()
            .await
            .insert(agent_id.to_string(), snapshot);
    }

    /// 节点记录删除时同步清掉快照
    pub async fn evict(&self, agent_id: &str) {
        self.snapshots.write().await.remove(agent_id);
    }

    /// 从 Agent 拉取最新过滤器配置并刷新缓存，返回拉到的快照
    pub async fn refresh(&self, agent_id: &str) -> Option<FilterSnapshot> {
        match self.push.get_filter_config(agent_id, "").await {
            Ok(response) if response.success => {
                self.store(agent_id, &response.config_version, response.filters)
                    .await;
                debug!(
                    "已刷新 Agent {} 过滤器快照: version={}",
                    agent_id, response.config_version
                );
                self.get(agent_id).await
            }
            Ok(response) => {
                warn!("拉取 Agent {} 过滤器配置被拒绝: {}", agent_id, response.message);
                None
            }
            Err(e) => {
                warn!("拉取 Agent {} 过滤器配置失败: {}", agent_id, e);
                None
            }
        }
    }

    /// 后台刷新（推送成功后调用，不阻塞请求路径）
    pub fn refresh_in_background(&self, agent_id: &str) {
        let cache = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            cache.refresh(&agent_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::TlsConfig;

    fn cache() -> FilterSnapshotCache {
        FilterSnapshotCache::new(Arc::new(AgentPushClient::new(&TlsConfig::default())))
    }

    fn filter(protocol: &str) -> xbox::ProtocolFilter {
        xbox::ProtocolFilter {
            protocol: protocol.to_string(),
            blacklist_domains: vec!["a.com".to_string()],
            blacklist_ips: vec![],
            blacklist_ports: vec![],
            whitelist_domains: vec![],
            whitelist_ips: vec![],
            whitelist_ports: vec![],
            enabled: true,
            last_updated: String::new(),
        }
    }

    #[tokio::test]
    async fn test_store_get_evict() {
        let cache = cache();
        assert!(cache.get("a1").await.is_none());

        cache.store("a1", "v1", vec![filter("http")]).await;
        let snapshot = cache.get("a1").await.unwrap();
        assert_eq!(snapshot.config_version, "v1");
        assert_eq!(snapshot.filters.len(), 1);
        assert_eq!(snapshot.filters[0].protocol, "http");

        // 同一节点覆盖写
        cache.store("a1", "v2", vec![filter("http"), filter("vmess")]).await;
        let snapshot = cache.get("a1").await.unwrap();
        assert_eq!(snapshot.config_version, "v2");
        assert_eq!(snapshot.filters.len(), 2);

        cache.evict("a1").await;
        assert!(cache.get("a1").await.is_none());
    }
}
