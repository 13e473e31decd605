//! Agent 侧 Controller RPC 客户端
//!
//! 持有到 Controller 的单一复用通道：开机注册、周期心跳、注册失效后自动重注册。
//! 同时承载 Controller 下发变更的本地执行入口（配置、过滤器、多路复用、回滚、卸载），
//! 由 gRPC 服务层（server.rs）调用。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use sysinfo::System;
use tokio::sync::RwLock;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Request;
use tracing::{error, info, warn};

use common::config::Config;
use common::grpc::xbox;
use common::grpc::ControllerServiceClient;

use crate::filter::{FilterStore, ListKind};
use crate::forwarder::{ForwarderConfig, RouteRule};
use crate::monitor::SystemMonitor;
use crate::multiplex;
use crate::network::{unknown_ip_range_info, IpRangeDetector};
use crate::supervisor::ForwarderSupervisor;
use crate::uninstall::{UninstallManager, UninstallResult};

/// 注册请求超时
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
/// 心跳请求超时
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
/// 卸载结果上报超时
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentClient {
    config: Arc<Config>,
    agent_id: String,
    supervisor: Arc<ForwarderSupervisor>,
    filter_store: Arc<FilterStore>,
    monitor: SystemMonitor,
    detector: IpRangeDetector,
    uninstall_manager: UninstallManager,
    /// 运维基础配置（未掺入过滤器规则），重新生成时的底版
    base_config: RwLock<Option<ForwarderConfig>>,
    /// Controller 通过 UpdateRules 管理的运维规则
    operator_rules: RwLock<Vec<xbox::Rule>>,
    rpc: RwLock<Option<ControllerServiceClient<Channel>>>,
    token: RwLock<String>,
    registered: AtomicBool,
}

impl AgentClient {
    pub fn new(config: Arc<Config>) -> Self {
        // 未配置时生成 hostname-unix秒 形式的稳定标识
        let agent_id = if config.agent.id.is_empty() {
            let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
            format!("{}-{}", hostname, Utc::now().timestamp())
        } else {
            config.agent.id.clone()
        };

        let supervisor = Arc::new(ForwarderSupervisor::new(
            &config.agent.forwarder_binary,
            &config.agent.forwarder_config,
        ));
        let filter_store = Arc::new(FilterStore::new(&config.agent.filter_config));
        let uninstall_manager = UninstallManager::new(
            &config.agent.forwarder_binary,
            &config.agent.forwarder_config,
            &config.agent.filter_config,
        );

        Self {
            config,
            agent_id,
            supervisor,
            filter_store,
            monitor: SystemMonitor::new(),
            detector: IpRangeDetector::new(),
            uninstall_manager,
            base_config: RwLock::new(None),
            operator_rules: RwLock::new(Vec::new()),
            rpc: RwLock::new(None),
            token: RwLock::new(String::new()),
            registered: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// 建立到 Controller 的 gRPC 通道
    pub async fn connect(&self) -> Result<()> {
        let addr = self.config.agent.controller_addr.clone();
        let mut endpoint = Channel::from_shared(addr.clone())
            .with_context(|| format!("无效的 Controller 地址: {}", addr))?
            .connect_timeout(Duration::from_secs(10));

        if self.config.grpc.tls.enabled {
            let tls = self.client_tls_config()?;
            endpoint = endpoint.tls_config(tls)?;
        } else {
            info!("TLS 未启用，与 Controller 使用明文通信（仅限实验环境）");
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| anyhow!("连接 Controller gRPC 失败: {}", e))?;

        *self.rpc.write().await = Some(ControllerServiceClient::new(channel));
        info!("已连接到 Controller: {}", addr);
        Ok(())
    }

    fn client_tls_config(&self) -> Result<ClientTlsConfig> {
        let tls_cfg = &self.config.grpc.tls;
        let mut tls = ClientTlsConfig::new();

        if !tls_cfg.ca_file.is_empty() {
            let ca = std::fs::read(&tls_cfg.ca_file)
                .with_context(|| format!("读取 CA 证书失败: {}", tls_cfg.ca_file))?;
            tls = tls.ca_certificate(Certificate::from_pem(ca));
        }
        if !tls_cfg.server_name.is_empty() {
            tls = tls.domain_name(tls_cfg.server_name.clone());
        }
        // 双向认证：携带客户端证书
        if !tls_cfg.cert_file.is_empty() && !tls_cfg.key_file.is_empty() {
            let cert = std::fs::read(&tls_cfg.cert_file)
                .with_context(|| format!("读取客户端证书失败: {}", tls_cfg.cert_file))?;
            let key = std::fs::read(&tls_cfg.key_file)
                .with_context(|| format!("读取客户端私钥失败: {}", tls_cfg.key_file))?;
            tls = tls.identity(Identity::from_pem(cert, key));
        }

        Ok(tls)
    }

    async fn client(&self) -> Result<ControllerServiceClient<Channel>> {
        self.rpc
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("gRPC 客户端未初始化"))
    }

    /// 注册到 Controller
    pub async fn register(&self) -> Result<()> {
        let mut client = self.client().await?;

        let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
        let mut metadata = self.monitor.system_info();
        metadata.insert("started".to_string(), Utc::now().to_rfc3339());

        // 检测 IP 段信息，失败不阻塞注册流程
        info!("正在检测节点 IP 段信息...");
        let ip_range_info = match self.detector.detect().await {
            Ok(info) => {
                info!(
                    "IP 段检测完成: {} ({}-{}-{}, {})",
                    info.ip_range, info.country, info.region, info.city, info.isp
                );
                info
            }
            Err(e) => {
                warn!("IP 段检测失败: {}", e);
                unknown_ip_range_info()
            }
        };

        let mut request = Request::new(xbox::RegisterRequest {
            agent_id: self.agent_id.clone(),
            hostname,
            ip_address: self.monitor.local_ip(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metadata,
            ip_range_info: Some(ip_range_info),
            rpc_port: self.config.agent.listen_port as u32,
        });
        request.set_timeout(REGISTER_TIMEOUT);

        let response = client
            .register_agent(request)
            .await
            .map_err(|e| anyhow!("注册 Agent 失败: {}", e))?
            .into_inner();

        if !response.success {
            bail!("注册失败: {}", response.message);
        }

        *self.token.write().await = response.token;
        self.registered.store(true, Ordering::SeqCst);
        info!("Agent 注册成功: ID={}", self.agent_id);
        Ok(())
    }

    /// 发送一次心跳，返回 Controller 建议的下次间隔
    pub async fn send_heartbeat(&self) -> Result<i64> {
        if !self.registered.load(Ordering::SeqCst) {
            bail!("Agent 未注册");
        }

        let mut client = self.client().await?;
        let mut metrics = self.monitor.collect_metrics();
        metrics.insert(
            "forwarder_running".to_string(),
            self.supervisor.is_running().to_string(),
        );
        metrics.insert(
            "forwarder_pid".to_string(),
            self.supervisor.get_pid().to_string(),
        );

        // IP 段变化时才在心跳里携带
        let ip_range_info = match self.detector.cached_info().await {
            Some(cached) => match self.detector.detect().await {
                Ok(current) if current.ip_range != cached.ip_range => {
                    info!("检测到 IP 段变化，心跳上报新的 IP 段: {}", current.ip_range);
                    Some(current)
                }
                _ => None,
            },
            None => self.detector.detect().await.ok(),
        };

        let token = self.token.read().await.clone();
        let mut request = Request::new(xbox::HeartbeatRequest {
            agent_id: self.agent_id.clone(),
            status: "online".to_string(),
            metrics,
            ip_range_info,
            token: if token.is_empty() { None } else { Some(token) },
        });
        request.set_timeout(HEARTBEAT_TIMEOUT);

        let response = client
            .heartbeat(request)
            .await
            .map_err(|e| anyhow!("发送心跳失败: {}", e))?
            .into_inner();

        if !response.success {
            // 注册状态失效，下个周期重新注册
            self.registered.store(false, Ordering::SeqCst);
            bail!("心跳被拒绝: {}", response.message);
        }

        Ok(response.next_heartbeat_interval)
    }

    /// 心跳循环：传输错误靠节奏自然退避，注册失效则下个周期重注册
    pub async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.agent.heartbeat_interval));
        interval.tick().await; // 跳过首次立即触发

        loop {
            interval.tick().await;

            if !self.registered.load(Ordering::SeqCst) {
                if let Err(e) = self.register().await {
                    error!("重新注册失败: {}", e);
                }
                continue;
            }

            if let Err(e) = self.send_heartbeat().await {
                warn!("心跳错误: {}", e);
            }
        }
    }

    // ─── Controller 下发变更的执行入口 ───────────────────────

    /// 应用 Controller 推送的完整 forwarder 配置
    pub async fn update_config(
        &self,
        config_content: &str,
        config_version: &str,
        force_update: bool,
    ) -> Result<String> {
        let parsed: ForwarderConfig =
            serde_json::from_str(config_content).context("解析配置失败")?;

        if force_update {
            info!("强制更新配置: version={}", config_version);
        }

        self.supervisor.update_config(&parsed).await?;
        *self.base_config.write().await = Some(parsed);

        info!("配置更新成功: version={}", config_version);
        Ok(config_version.to_string())
    }

    /// 应用规则变更（route 类型并入路由，其余类型仅记录）
    pub async fn update_rules(&self, operation: &str, rules: Vec<xbox::Rule>) -> Result<()> {
        {
            let mut operator_rules = self.operator_rules.write().await;
            match operation {
                "add" => {
                    for rule in rules {
                        operator_rules.retain(|r| r.id != rule.id);
                        operator_rules.push(rule);
                    }
                }
                "remove" => {
                    let ids: Vec<String> = rules.into_iter().map(|r| r.id).collect();
                    operator_rules.retain(|r| !ids.contains(&r.id));
                }
                "replace" => {
                    *operator_rules = rules;
                }
                other => bail!("不支持的操作: {}", other),
            }
        }

        self.regenerate_forwarder_config().await
    }

    /// 更新黑名单并重新生成 forwarder 配置，返回新过滤器版本
    pub async fn update_blacklist(
        &self,
        protocol: &str,
        domains: &[String],
        ips: &[String],
        ports: &[String],
        operation: &str,
    ) -> Result<String> {
        let version = self
            .filter_store
            .update_list(ListKind::Blacklist, protocol, domains, ips, ports, operation)
            .await?;
        self.regenerate_forwarder_config().await?;
        info!("黑名单更新成功: protocol={}, operation={}", protocol, operation);
        Ok(version)
    }

    /// 更新白名单并重新生成 forwarder 配置，返回新过滤器版本
    pub async fn update_whitelist(
        &self,
        protocol: &str,
        domains: &[String],
        ips: &[String],
        ports: &[String],
        operation: &str,
    ) -> Result<String> {
        let version = self
            .filter_store
            .update_list(ListKind::Whitelist, protocol, domains, ips, ports, operation)
            .await?;
        self.regenerate_forwarder_config().await?;
        info!("白名单更新成功: protocol={}, operation={}", protocol, operation);
        Ok(version)
    }

    /// 查询过滤器配置；protocol 为空返回全部
    pub async fn get_filter_config(&self, protocol: &str) -> Vec<xbox::ProtocolFilter> {
        let filters = if protocol.is_empty() {
            self.filter_store.get_all_filters().await
        } else {
            let mut map = std::collections::BTreeMap::new();
            if let Some(filter) = self.filter_store.get_filter(protocol).await {
                map.insert(protocol.to_string(), filter);
            }
            map
        };

        filters
            .into_values()
            .map(|f| xbox::ProtocolFilter {
                protocol: f.protocol,
                blacklist_domains: f.blacklist_domains,
                blacklist_ips: f.blacklist_ips,
                blacklist_ports: f.blacklist_ports,
                whitelist_domains: f.whitelist_domains,
                whitelist_ips: f.whitelist_ips,
                whitelist_ports: f.whitelist_ports,
                enabled: f.enabled,
                last_updated: f.last_updated.to_rfc3339(),
            })
            .collect()
    }

    pub async fn filter_version(&self) -> String {
        self.filter_store.current_version().await
    }

    /// 更新多路复用配置并应用
    pub async fn update_multiplex(
        &self,
        protocol: &str,
        request: &xbox::MultiplexConfig,
    ) -> Result<String> {
        let mut base = self.effective_base_config().await;
        let updated = multiplex::apply_multiplex(&mut base, protocol, request)?;
        info!("多路复用配置影响的出站: {:?}", updated);

        *self.base_config.write().await = Some(base);
        self.regenerate_forwarder_config().await?;

        Ok(format!("v{}", Utc::now().timestamp()))
    }

    /// 读取多路复用配置
    pub async fn get_multiplex(&self, protocol: &str) -> Result<Vec<xbox::ProtocolMultiplex>> {
        if !protocol.is_empty() && !multiplex::is_multiplex_protocol(protocol) {
            bail!("不支持的协议类型: {}", protocol);
        }
        let base = self.effective_base_config().await;
        Ok(multiplex::extract_multiplex(&base, protocol))
    }

    /// 回滚过滤器配置到指定版本并重新生成
    pub async fn rollback(&self, target_version: &str, reason: &str) -> Result<(String, String)> {
        info!("开始配置回滚: target={}, reason={}", target_version, reason);

        let rolled_back = self.filter_store.rollback(target_version).await?;
        self.regenerate_forwarder_config().await?;

        let current = self.filter_store.current_version().await;
        info!("配置回滚成功: version={}", rolled_back);
        Ok((rolled_back, current))
    }

    /// 执行本机卸载：跑流水线 → 上报结果 → 计划退出
    pub async fn uninstall(
        &self,
        force: bool,
        reason: &str,
        timeout_seconds: i32,
    ) -> UninstallResult {
        info!(
            "收到卸载请求: force={}, reason={}, timeout={}s",
            force, reason, timeout_seconds
        );

        let result = self.uninstall_manager.run(force, timeout_seconds).await;

        if let Err(e) = self.report_uninstall_result(&result).await {
            warn!("上报卸载结果失败: {}", e);
        }

        // 延迟退出，保证响应送达
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            info!("Agent 即将退出...");
            std::process::exit(0);
        });

        result
    }

    /// 以特殊心跳形式把卸载结果报回 Controller
    async fn report_uninstall_result(&self, result: &UninstallResult) -> Result<()> {
        let mut client = self.client().await?;

        let mut metrics = std::collections::HashMap::new();
        metrics.insert("uninstall_status".to_string(), result.status.clone());
        metrics.insert("uninstall_success".to_string(), result.success.to_string());
        metrics.insert("uninstall_message".to_string(), result.message.clone());
        metrics.insert("cleanup_time_ms".to_string(), result.cleanup_time_ms.to_string());
        metrics.insert(
            "cleaned_files_count".to_string(),
            result.cleaned_files.len().to_string(),
        );

        let token = self.token.read().await.clone();
        let mut request = Request::new(xbox::HeartbeatRequest {
            agent_id: self.agent_id.clone(),
            status: "uninstalling".to_string(),
            metrics,
            ip_range_info: None,
            token: if token.is_empty() { None } else { Some(token) },
        });
        request.set_timeout(REPORT_TIMEOUT);

        let response = client
            .heartbeat(request)
            .await
            .map_err(|e| anyhow!("发送卸载结果失败: {}", e))?
            .into_inner();

        if !response.success {
            bail!("Controller 拒绝卸载结果: {}", response.message);
        }

        info!("卸载结果已上报到 Controller");
        Ok(())
    }

    // ─── forwarder 配置生成 ─────────────────────────────────

    /// 取当前底版配置：内存底版 → 磁盘文件 → 内置默认
    async fn effective_base_config(&self) -> ForwarderConfig {
        if let Some(base) = self.base_config.read().await.clone() {
            return base;
        }
        if let Ok(loaded) = self.supervisor.load_config_from_file().await {
            *self.base_config.write().await = Some(loaded.clone());
            return loaded;
        }
        ForwarderConfig::default_base()
    }

    /// 过滤器规则 + 运维规则拼到底版前面，请求 supervisor 换入
    async fn regenerate_forwarder_config(&self) -> Result<()> {
        let mut composed = self.effective_base_config().await;

        let mut rules = self.filter_store.generate_route_rules().await;
        rules.extend(self.operator_route_rules().await);

        let mut route = composed.route.unwrap_or_default();
        let base_rules = route.rules;
        route.rules = rules;
        route.rules.extend(base_rules);
        composed.route = Some(route);

        self.supervisor
            .update_config(&composed)
            .await
            .context("重新生成配置失败")?;
        Ok(())
    }

    /// 解析 UpdateRules 管理的启用 route 规则
    async fn operator_route_rules(&self) -> Vec<RouteRule> {
        let rules = self.operator_rules.read().await;
        rules
            .iter()
            .filter(|r| r.enabled && r.r#type == "route")
            .filter_map(|r| match serde_json::from_str::<RouteRule>(&r.content) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("解析路由规则 {} 失败: {}", r.id, e);
                    None
                }
            })
            .collect()
    }

    /// 自动启动 forwarder（二进制与配置都就绪时）
    pub async fn maybe_start_forwarder(&self) {
        let binary = &self.config.agent.forwarder_binary;
        let config_path = &self.config.agent.forwarder_config;

        if binary.is_empty() || !std::path::Path::new(config_path).exists() {
            info!("forwarder 配置未就绪，跳过自动启动");
            return;
        }

        if let Err(e) = self.supervisor.load_config_from_file().await {
            warn!("加载 forwarder 配置失败: {}", e);
        } else if let Some(config) = self.supervisor.get_config().await {
            *self.base_config.write().await = Some(config);
        }

        match self.supervisor.start().await {
            Ok(()) => info!("forwarder 服务已启动"),
            Err(e) => error!("启动 forwarder 失败: {}", e),
        }
    }

    /// 进程退出前的清理：停掉 forwarder、关闭通道
    pub async fn shutdown(&self) {
        if let Err(e) = self.supervisor.stop().await {
            error!("停止 forwarder 失败: {}", e);
        }
        *self.rpc.write().await = None;
    }
}
