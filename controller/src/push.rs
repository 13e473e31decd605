//! Controller → Agent 推送客户端
//!
//! 按 agent id 维护懒建连接池。目标地址从注册表解析
//! （注册时上报的 ip_address + rpc_port），推送超时默认 30 秒。

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Request;
use tracing::{info, warn};

use common::config::TlsConfig;
use common::grpc::xbox;
use common::grpc::AgentServiceClient;

use crate::migration::get_connection;
use crate::repository;

/// 变更推送默认超时
const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AgentPushClient {
    connections: Mutex<HashMap<String, AgentServiceClient<Channel>>>,
    tls: Option<ClientTlsConfig>,
}

impl AgentPushClient {
    pub fn new(tls_config: &TlsConfig) -> Self {
        let tls = if tls_config.enabled {
            match build_client_tls(tls_config) {
                Ok(tls) => Some(tls),
                Err(e) => {
                    warn!("加载推送 TLS 配置失败: {}，回退到明文模式", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            connections: Mutex::new(HashMap::new()),
            tls,
        }
    }

    /// 获取或建立到 Agent 的连接，地址从注册表解析
    async fn connection(&self, agent_id: &str) -> Result<AgentServiceClient<Channel>> {
        {
            let connections = self.connections.lock().await;
            if let Some(client) = connections.get(agent_id) {
                return Ok(client.clone());
            }
        }

        let db = get_connection().await;
        let agent = repository::get_by_id(db, agent_id)
            .await?
            .ok_or_else(|| anyhow!("Agent {} 不存在", agent_id))?;

        if agent.ip_address.is_empty() || agent.ip_address == "unknown" {
            bail!("Agent {} 未上报可达地址", agent_id);
        }

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let address = format!("{}://{}:{}", scheme, agent.ip_address, agent.rpc_port);

        let mut endpoint = Channel::from_shared(address.clone())
            .with_context(|| format!("无效的 Agent 地址: {}", address))?
            .connect_timeout(Duration::from_secs(10));
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| anyhow!("连接到 Agent {} ({}) 失败: {}", agent_id, address, e))?;

        info!("已建立到 Agent {} 的推送连接: {}", agent_id, address);
        let client = AgentServiceClient::new(channel);
        self.connections
            .lock()
            .await
            .insert(agent_id.to_string(), client.clone());
        Ok(client)
    }

    /// 传输层失败后丢弃缓存连接，下次重建
    async fn invalidate(&self, agent_id: &str) {
        self.connections.lock().await.remove(agent_id);
    }

    /// 推送完整 forwarder 配置
    pub async fn update_config(
        &self,
        agent_id: &str,
        config_content: &str,
        config_version: &str,
        force_update: bool,
    ) -> Result<xbox::ConfigResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::ConfigRequest {
            agent_id: agent_id.to_string(),
            config_content: config_content.to_string(),
            config_version: config_version.to_string(),
            force_update,
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.update_config(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent UpdateConfig 失败: {}", e))
            }
        }
    }

    /// 推送规则变更
    pub async fn update_rules(
        &self,
        agent_id: &str,
        operation: &str,
        rules: Vec<xbox::Rule>,
    ) -> Result<xbox::RulesResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::RulesRequest {
            agent_id: agent_id.to_string(),
            operation: operation.to_string(),
            rules,
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.update_rules(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent UpdateRules 失败: {}", e))
            }
        }
    }

    /// 推送黑名单变更
    #[allow(clippy::too_many_arguments)]
    pub async fn update_blacklist(
        &self,
        agent_id: &str,
        protocol: &str,
        domains: Vec<String>,
        ips: Vec<String>,
        ports: Vec<String>,
        operation: &str,
    ) -> Result<xbox::FilterUpdateResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::BlacklistRequest {
            agent_id: agent_id.to_string(),
            protocol: protocol.to_string(),
            domains,
            ips,
            ports,
            operation: operation.to_string(),
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.update_blacklist(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent UpdateBlacklist 失败: {}", e))
            }
        }
    }

    /// 推送白名单变更
    #[allow(clippy::too_many_arguments)]
    pub async fn update_whitelist(
        &self,
        agent_id: &str,
        protocol: &str,
        domains: Vec<String>,
        ips: Vec<String>,
        ports: Vec<String>,
        operation: &str,
    ) -> Result<xbox::FilterUpdateResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::WhitelistRequest {
            agent_id: agent_id.to_string(),
            protocol: protocol.to_string(),
            domains,
            ips,
            ports,
            operation: operation.to_string(),
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.update_whitelist(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent UpdateWhitelist 失败: {}", e))
            }
        }
    }

    /// 查询 Agent 过滤器配置
    pub async fn get_filter_config(
        &self,
        agent_id: &str,
        protocol: &str,
    ) -> Result<xbox::FilterConfigResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::FilterConfigRequest {
            agent_id: agent_id.to_string(),
            protocol: protocol.to_string(),
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.get_filter_config(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent GetFilterConfig 失败: {}", e))
            }
        }
    }

    /// 推送多路复用配置
    pub async fn update_multiplex_config(
        &self,
        agent_id: &str,
        protocol: &str,
        config: xbox::MultiplexConfig,
    ) -> Result<xbox::MultiplexConfigResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::MultiplexConfigRequest {
            agent_id: agent_id.to_string(),
            protocol: protocol.to_string(),
            multiplex_config: Some(config),
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.update_multiplex_config(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent UpdateMultiplexConfig 失败: {}", e))
            }
        }
    }

    /// 查询 Agent 多路复用配置
    pub async fn get_multiplex_config(
        &self,
        agent_id: &str,
        protocol: &str,
    ) -> Result<xbox::MultiplexStatusResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::MultiplexStatusRequest {
            agent_id: agent_id.to_string(),
            protocol: protocol.to_string(),
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.get_multiplex_config(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent GetMultiplexConfig 失败: {}", e))
            }
        }
    }

    /// 推送回滚请求
    pub async fn rollback_config(
        &self,
        agent_id: &str,
        target_version: &str,
        reason: &str,
    ) -> Result<xbox::RollbackResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::RollbackRequest {
            agent_id: agent_id.to_string(),
            target_version: target_version.to_string(),
            reason: reason.to_string(),
        });
        request.set_timeout(PUSH_TIMEOUT);

        match client.rollback_config(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent RollbackConfig 失败: {}", e))
            }
        }
    }

    /// 下发卸载指令，RPC 超时跟随任务超时再放宽 10 秒
    pub async fn uninstall(
        &self,
        agent_id: &str,
        force_uninstall: bool,
        reason: &str,
        timeout_seconds: i32,
    ) -> Result<xbox::UninstallResponse> {
        let mut client = self.connection(agent_id).await?;
        let mut request = Request::new(xbox::UninstallRequest {
            agent_id: agent_id.to_string(),
            force_uninstall,
            reason: reason.to_string(),
            timeout_seconds,
        });
        request.set_timeout(Duration::from_secs(timeout_seconds.max(0) as u64 + 10));

        match client.uninstall(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => {
                self.invalidate(agent_id).await;
                Err(anyhow!("调用 Agent Uninstall 失败: {}", e))
            }
        }
    }
}

fn build_client_tls(tls_config: &TlsConfig) -> Result<ClientTlsConfig> {
    let mut tls = ClientTlsConfig::new();
    if !tls_config.ca_file.is_empty() {
        let ca = std::fs::read(&tls_config.ca_file)
            .with_context(|| format!("读取 CA 证书失败: {}", tls_config.ca_file))?;
        tls = tls.ca_certificate(Certificate::from_pem(ca));
    }
    if !tls_config.server_name.is_empty() {
        tls = tls.domain_name(tls_config.server_name.clone());
    }
    if !tls_config.cert_file.is_empty() && !tls_config.key_file.is_empty() {
        let cert = std::fs::read(&tls_config.cert_file)
            .with_context(|| format!("读取客户端证书失败: {}", tls_config.cert_file))?;
        let key = std::fs::read(&tls_config.key_file)
            .with_context(|| format!("读取客户端私钥失败: {}", tls_config.key_file))?;
        tls = tls.identity(Identity::from_pem(cert, key));
    }
    Ok(tls)
}
