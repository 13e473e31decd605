//! 协议过滤器存储
//!
//! 按协议维护黑/白名单三元组（域名、IP 段、端口），持久化为单个 JSON 文档。
//! 每次变更生成 `v<unix秒>` 新版本并把旧文件备份为 `<path>.<版本>.backup`，
//! 版本环保留最近 10 个，回滚即恢复对应备份文件。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::forwarder::RouteRule;

/// 识别的协议标签
pub const SUPPORTED_PROTOCOLS: [&str; 7] = [
    "http",
    "https",
    "socks5",
    "shadowsocks",
    "vmess",
    "trojan",
    "vless",
];

/// 版本环容量
const VERSION_RING_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolFilter {
    pub protocol: String,
    pub blacklist_domains: Vec<String>,
    pub blacklist_ips: Vec<String>,
    pub blacklist_ports: Vec<String>,
    pub whitelist_domains: Vec<String>,
    pub whitelist_ips: Vec<String>,
    pub whitelist_ports: Vec<String>,
    pub enabled: bool,
    pub last_updated: DateTime<Utc>,
}

impl ProtocolFilter {
    fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            blacklist_domains: Vec::new(),
            blacklist_ips: Vec::new(),
            blacklist_ports: Vec::new(),
            whitelist_domains: Vec::new(),
            whitelist_ips: Vec::new(),
            whitelist_ports: Vec::new(),
            enabled: true,
            last_updated: Utc::now(),
        }
    }
}

/// 过滤器配置文件结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDocument {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub filters: BTreeMap<String, ProtocolFilter>,
}

struct FilterState {
    filters: BTreeMap<String, ProtocolFilter>,
    /// 历史版本，尾部为最近被替换的版本
    versions: Vec<String>,
    current_version: String,
}

pub struct FilterStore {
    config_path: PathBuf,
    state: RwLock<FilterState>,
}

/// 名单类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Blacklist,
    Whitelist,
}

impl FilterStore {
    /// 创建过滤器存储，磁盘上已有配置时加载，否则初始化默认协议集
    pub fn new(config_path: &str) -> Self {
        let path = PathBuf::from(config_path);

        let state = match Self::load_document(&path) {
            Ok(doc) => FilterState {
                filters: doc.filters,
                versions: Vec::new(),
                current_version: doc.version,
            },
            Err(e) => {
                warn!("加载过滤器配置失败: {}，使用默认协议集", e);
                let mut filters = BTreeMap::new();
                for protocol in SUPPORTED_PROTOCOLS {
                    filters.insert(protocol.to_string(), ProtocolFilter::new(protocol));
                }
                FilterState {
                    filters,
                    versions: Vec::new(),
                    current_version: format!("v{}", Utc::now().timestamp()),
                }
            }
        };

        Self {
            config_path: path,
            state: RwLock::new(state),
        }
    }

    fn load_document(path: &Path) -> Result<FilterDocument> {
        if !path.exists() {
            bail!("配置文件不存在");
        }
        let data = std::fs::read_to_string(path)?;
        let doc: FilterDocument = serde_json::from_str(&data)?;
        Ok(doc)
    }

    /// 更新黑/白名单，返回新版本号
    pub async fn update_list(
        &self,
        kind: ListKind,
        protocol: &str,
        domains: &[String],
        ips: &[String],
        ports: &[String],
        operation: &str,
    ) -> Result<String> {
        let mut state = self.state.write().await;

        let filter = state
            .filters
            .entry(protocol.to_string())
            .or_insert_with(|| ProtocolFilter::new(protocol));

        let (list_domains, list_ips, list_ports) = match kind {
            ListKind::Blacklist => (
                &mut filter.blacklist_domains,
                &mut filter.blacklist_ips,
                &mut filter.blacklist_ports,
            ),
            ListKind::Whitelist => (
                &mut filter.whitelist_domains,
                &mut filter.whitelist_ips,
                &mut filter.whitelist_ports,
            ),
        };

        match operation {
            "add" => {
                merge_unique(list_domains, domains);
                merge_unique(list_ips, ips);
                merge_unique(list_ports, ports);
            }
            "remove" => {
                remove_items(list_domains, domains);
                remove_items(list_ips, ips);
                remove_items(list_ports, ports);
            }
            "replace" => {
                *list_domains = dedup(domains);
                *list_ips = dedup(ips);
                *list_ports = dedup(ports);
            }
            "clear" => {
                list_domains.clear();
                list_ips.clear();
                list_ports.clear();
            }
            other => bail!("不支持的操作: {}", other),
        }

        filter.last_updated = Utc::now();
        self.rotate_and_save(&mut state)
    }

    /// 获取指定协议的过滤器
    pub async fn get_filter(&self, protocol: &str) -> Option<ProtocolFilter> {
        self.state.read().await.filters.get(protocol).cloned()
    }

    /// 获取所有过滤器
    pub async fn get_all_filters(&self) -> BTreeMap<String, ProtocolFilter> {
        self.state.read().await.filters.clone()
    }

    pub async fn current_version(&self) -> String {
        self.state.read().await.current_version.clone()
    }

    /// 回滚到指定版本；target 为空回滚到上一个版本
    ///
    /// 通过整文件拷贝恢复备份，保证恢复后的字节与该版本写入时一致。
    pub async fn rollback(&self, target: &str) -> Result<String> {
        let mut state = self.state.write().await;

        let target = if target.is_empty() {
            if state.versions.len() < 2 {
                bail!("没有可回滚的版本");
            }
            state.versions.last().cloned().unwrap()
        } else {
            target.to_string()
        };

        let backup_path = self.backup_path(&target);
        if !backup_path.exists() {
            bail!("版本 {} 的备份文件不存在", target);
        }

        let data = std::fs::read_to_string(&backup_path)
            .with_context(|| format!("读取备份配置失败: {}", backup_path.display()))?;
        let doc: FilterDocument =
            serde_json::from_str(&data).context("解析备份配置失败")?;

        std::fs::copy(&backup_path, &self.config_path)
            .with_context(|| format!("恢复备份失败: {}", backup_path.display()))?;

        state.filters = doc.filters;
        state.current_version = target.clone();

        info!("过滤器配置已回滚到版本 {}", target);
        Ok(target)
    }

    /// 由启用的过滤器生成路由规则
    ///
    /// 每个协议至多两条：黑名单 → block 在前，白名单 → direct 在后。
    /// 协议按字典序迭代，同一份过滤器映射生成结果恒定。
    pub async fn generate_route_rules(&self) -> Vec<RouteRule> {
        let state = self.state.read().await;
        let mut rules = Vec::new();

        for (protocol, filter) in state.filters.iter() {
            if !filter.enabled {
                continue;
            }

            if !filter.blacklist_domains.is_empty()
                || !filter.blacklist_ips.is_empty()
                || !filter.blacklist_ports.is_empty()
            {
                rules.push(RouteRule {
                    protocol: protocol.clone(),
                    domain: filter.blacklist_domains.clone(),
                    ip_cidr: filter.blacklist_ips.clone(),
                    port: filter.blacklist_ports.clone(),
                    outbound: "block".to_string(),
                    ..Default::default()
                });
            }

            if !filter.whitelist_domains.is_empty()
                || !filter.whitelist_ips.is_empty()
                || !filter.whitelist_ports.is_empty()
            {
                rules.push(RouteRule {
                    protocol: protocol.clone(),
                    domain: filter.whitelist_domains.clone(),
                    ip_cidr: filter.whitelist_ips.clone(),
                    port: filter.whitelist_ports.clone(),
                    outbound: "direct".to_string(),
                    ..Default::default()
                });
            }
        }

        rules
    }

    /// 备份当前文件、轮转版本环并写入新文档，返回新版本号
    fn rotate_and_save(&self, state: &mut FilterState) -> Result<String> {
        let new_version = format!("v{}", Utc::now().timestamp());

        // 备份被替换的版本
        if self.config_path.exists() {
            let backup_path = self.backup_path(&state.current_version);
            if let Err(e) = std::fs::copy(&self.config_path, &backup_path) {
                warn!("备份过滤器配置失败: {}", e);
            }
        }

        let replaced = state.current_version.clone();
        state.versions.push(replaced);
        state.current_version = new_version.clone();

        // 只保留最近 N 个版本，被挤出的版本连同备份文件一起清理
        while state.versions.len() > VERSION_RING_SIZE {
            let dropped = state.versions.remove(0);
            let dropped_backup = self.backup_path(&dropped);
            if dropped_backup.exists() {
                std::fs::remove_file(&dropped_backup).ok();
            }
        }

        self.save_document(state)?;
        Ok(new_version)
    }

    fn save_document(&self, state: &FilterState) -> Result<()> {
        let doc = FilterDocument {
            version: state.current_version.clone(),
            timestamp: Utc::now(),
            filters: state.filters.clone(),
        };

        let data = serde_json::to_string_pretty(&doc).context("序列化过滤器配置失败")?;
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        std::fs::write(&self.config_path, data)
            .with_context(|| format!("写入过滤器配置失败: {}", self.config_path.display()))?;
        Ok(())
    }

    fn backup_path(&self, version: &str) -> PathBuf {
        let mut path = self.config_path.as_os_str().to_owned();
        path.push(format!(".{}.backup", version));
        PathBuf::from(path)
    }
}

/// 合并并去重，保持既有顺序
fn merge_unique(existing: &mut Vec<String>, new_items: &[String]) {
    for item in new_items {
        if !existing.contains(item) {
            existing.push(item.clone());
        }
    }
}

fn remove_items(existing: &mut Vec<String>, to_remove: &[String]) {
    existing.retain(|item| !to_remove.contains(item));
}

fn dedup(items: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    merge_unique(&mut result, items);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> FilterStore {
        let path = dir.path().join("filter.json");
        FilterStore::new(path.to_str().unwrap())
    }

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|i| i.to_string()).collect()
    }

    #[tokio::test]
    async fn test_new_store_seeds_default_protocols() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let filters = store.get_all_filters().await;
        assert_eq!(filters.len(), 7);
        for protocol in SUPPORTED_PROTOCOLS {
            assert!(filters.contains_key(protocol));
            assert!(filters[protocol].enabled);
        }
    }

    #[tokio::test]
    async fn test_blacklist_add_then_generate() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .update_list(
                ListKind::Blacklist,
                "http",
                &s(&["a.com", "b.com"]),
                &[],
                &[],
                "add",
            )
            .await
            .unwrap();

        let rules = store.generate_route_rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].protocol, "http");
        assert_eq!(rules[0].outbound, "block");
        assert_eq!(rules[0].domain, s(&["a.com", "b.com"]));
        assert!(rules[0].ip_cidr.is_empty());
    }

    #[tokio::test]
    async fn test_blacklist_precedes_whitelist() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .update_list(ListKind::Whitelist, "http", &s(&["x.com"]), &[], &[], "add")
            .await
            .unwrap();
        store
            .update_list(ListKind::Blacklist, "http", &s(&["x.com"]), &[], &[], "add")
            .await
            .unwrap();

        let rules = store.generate_route_rules().await;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].outbound, "block");
        assert_eq!(rules[1].outbound, "direct");
    }

    #[tokio::test]
    async fn test_operations_are_set_semantics() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        // add 去重
        store
            .update_list(
                ListKind::Blacklist,
                "vmess",
                &s(&["a.com", "a.com"]),
                &[],
                &[],
                "add",
            )
            .await
            .unwrap();
        store
            .update_list(ListKind::Blacklist, "vmess", &s(&["a.com"]), &[], &[], "add")
            .await
            .unwrap();
        let filter = store.get_filter("vmess").await.unwrap();
        assert_eq!(filter.blacklist_domains, s(&["a.com"]));

        // replace 幂等
        store
            .update_list(
                ListKind::Blacklist,
                "vmess",
                &s(&["b.com"]),
                &s(&["10.0.0.0/8"]),
                &[],
                "replace",
            )
            .await
            .unwrap();
        store
            .update_list(
                ListKind::Blacklist,
                "vmess",
                &s(&["b.com"]),
                &s(&["10.0.0.0/8"]),
                &[],
                "replace",
            )
            .await
            .unwrap();
        let filter = store.get_filter("vmess").await.unwrap();
        assert_eq!(filter.blacklist_domains, s(&["b.com"]));
        assert_eq!(filter.blacklist_ips, s(&["10.0.0.0/8"]));

        // remove
        store
            .update_list(ListKind::Blacklist, "vmess", &s(&["b.com"]), &[], &[], "remove")
            .await
            .unwrap();
        let filter = store.get_filter("vmess").await.unwrap();
        assert!(filter.blacklist_domains.is_empty());
        assert_eq!(filter.blacklist_ips, s(&["10.0.0.0/8"]));

        // clear 幂等
        store
            .update_list(ListKind::Blacklist, "vmess", &[], &[], &[], "clear")
            .await
            .unwrap();
        store
            .update_list(ListKind::Blacklist, "vmess", &[], &[], &[], "clear")
            .await
            .unwrap();
        let filter = store.get_filter("vmess").await.unwrap();
        assert!(filter.blacklist_ips.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let err = store
            .update_list(ListKind::Blacklist, "http", &[], &[], &[], "merge")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("不支持的操作"));
    }

    #[tokio::test]
    async fn test_document_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filter.json");
        let store = FilterStore::new(path.to_str().unwrap());

        store
            .update_list(
                ListKind::Blacklist,
                "trojan",
                &s(&["bad.example"]),
                &s(&["192.168.1.0/24"]),
                &s(&["8080"]),
                "add",
            )
            .await
            .unwrap();
        let before = store.get_all_filters().await;
        let version = store.current_version().await;

        // 重新加载同一文件
        let reloaded = FilterStore::new(path.to_str().unwrap());
        assert_eq!(reloaded.get_all_filters().await, before);
        assert_eq!(reloaded.current_version().await, version);
    }

    #[tokio::test]
    async fn test_rollback_restores_exact_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filter.json");
        let store = FilterStore::new(path.to_str().unwrap());

        store
            .update_list(ListKind::Blacklist, "http", &s(&["a.com"]), &[], &[], "add")
            .await
            .unwrap();
        let snapshot_version = store.current_version().await;
        let snapshot_bytes = std::fs::read(&path).unwrap();
        let snapshot_filters = store.get_all_filters().await;

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        store
            .update_list(ListKind::Blacklist, "http", &s(&["b.com"]), &[], &[], "add")
            .await
            .unwrap();
        assert_ne!(store.current_version().await, snapshot_version);

        let rolled = store.rollback(&snapshot_version).await.unwrap();
        assert_eq!(rolled, snapshot_version);
        assert_eq!(store.current_version().await, snapshot_version);
        assert_eq!(store.get_all_filters().await, snapshot_filters);
        assert_eq!(std::fs::read(&path).unwrap(), snapshot_bytes);
    }

    #[tokio::test]
    async fn test_rollback_empty_target_needs_history() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let err = store.rollback("").await.unwrap_err();
        assert!(err.to_string().contains("没有可回滚的版本"));
    }

    #[tokio::test]
    async fn test_rollback_missing_backup_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let err = store.rollback("v1").await.unwrap_err();
        assert!(err.to_string().contains("备份文件不存在"));
    }

    #[tokio::test]
    async fn test_generate_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .update_list(ListKind::Blacklist, "vless", &s(&["v.com"]), &[], &[], "add")
            .await
            .unwrap();
        store
            .update_list(ListKind::Blacklist, "http", &s(&["h.com"]), &[], &[], "add")
            .await
            .unwrap();

        let first = store.generate_route_rules().await;
        let second = store.generate_route_rules().await;
        assert_eq!(first, second);
        // 协议按字典序排列
        assert_eq!(first[0].protocol, "http");
        assert_eq!(first[1].protocol, "vless");
    }
}
