//! Agent 侧 gRPC 服务
//!
//! 接收 Controller 下发的变更请求，分发给 AgentClient 执行。
//! 任何 agent_id 与本机不符的请求直接拒绝，不触碰任何状态。

use std::sync::Arc;

use anyhow::{Context, Result};
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use common::config::Config;
use common::grpc::xbox;
use common::grpc::{AgentService, AgentServiceServer};

use crate::client::AgentClient;

pub struct AgentRpcServer {
    client: Arc<AgentClient>,
}

impl AgentRpcServer {
    pub fn new(client: Arc<AgentClient>) -> Self {
        Self { client }
    }

    /// agent_id 校验，不匹配时返回拒绝消息
    fn check_agent_id(&self, agent_id: &str) -> Option<String> {
        if agent_id != self.client.agent_id() {
            warn!(
                "Agent ID 不匹配: 期望={}, 收到={}",
                self.client.agent_id(),
                agent_id
            );
            return Some("agent id mismatch".to_string());
        }
        None
    }
}

#[tonic::async_trait]
impl AgentService for AgentRpcServer {
    async fn update_config(
        &self,
        request: Request<xbox::ConfigRequest>,
    ) -> Result<Response<xbox::ConfigResponse>, Status> {
        let req = request.into_inner();
        info!("收到配置更新请求: version={}", req.config_version);

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::ConfigResponse {
                success: false,
                message,
                applied_version: String::new(),
            }));
        }

        match self
            .client
            .update_config(&req.config_content, &req.config_version, req.force_update)
            .await
        {
            Ok(version) => Ok(Response::new(xbox::ConfigResponse {
                success: true,
                message: "配置更新成功".to_string(),
                applied_version: version,
            })),
            Err(e) => {
                error!("配置更新失败: {:#}", e);
                Ok(Response::new(xbox::ConfigResponse {
                    success: false,
                    message: format!("配置更新失败: {:#}", e),
                    applied_version: req.config_version,
                }))
            }
        }
    }

    async fn update_rules(
        &self,
        request: Request<xbox::RulesRequest>,
    ) -> Result<Response<xbox::RulesResponse>, Status> {
        let req = request.into_inner();
        info!(
            "收到规则更新请求: operation={}, rules={}",
            req.operation,
            req.rules.len()
        );

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::RulesResponse {
                success: false,
                message,
            }));
        }

        match self.client.update_rules(&req.operation, req.rules).await {
            Ok(()) => Ok(Response::new(xbox::RulesResponse {
                success: true,
                message: "规则更新成功".to_string(),
            })),
            Err(e) => Ok(Response::new(xbox::RulesResponse {
                success: false,
                message: format!("规则更新失败: {:#}", e),
            })),
        }
    }

    async fn update_blacklist(
        &self,
        request: Request<xbox::BlacklistRequest>,
    ) -> Result<Response<xbox::FilterUpdateResponse>, Status> {
        let req = request.into_inner();
        info!(
            "收到黑名单更新请求: protocol={}, operation={}",
            req.protocol, req.operation
        );

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::FilterUpdateResponse {
                success: false,
                message,
                config_version: String::new(),
            }));
        }

        match self
            .client
            .update_blacklist(&req.protocol, &req.domains, &req.ips, &req.ports, &req.operation)
            .await
        {
            Ok(version) => Ok(Response::new(xbox::FilterUpdateResponse {
                success: true,
                message: "黑名单更新成功".to_string(),
                config_version: version,
            })),
            Err(e) => Ok(Response::new(xbox::FilterUpdateResponse {
                success: false,
                message: format!("黑名单更新失败: {:#}", e),
                config_version: String::new(),
            })),
        }
    }

    async fn update_whitelist(
        &self,
        request: Request<xbox::WhitelistRequest>,
    ) -> Result<Response<xbox::FilterUpdateResponse>, Status> {
        let req = request.into_inner();
        info!(
            "收到白名单更新请求: protocol={}, operation={}",
            req.protocol, req.operation
        );

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::FilterUpdateResponse {
                success: false,
                message,
                config_version: String::new(),
            }));
        }

        match self
            .client
            .update_whitelist(&req.protocol, &req.domains, &req.ips, &req.ports, &req.operation)
            .await
        {
            Ok(version) => Ok(Response::new(xbox::FilterUpdateResponse {
                success: true,
                message: "白名单更新成功".to_string(),
                config_version: version,
            })),
            Err(e) => Ok(Response::new(xbox::FilterUpdateResponse {
                success: false,
                message: format!("白名单更新失败: {:#}", e),
                config_version: String::new(),
            })),
        }
    }

    async fn get_filter_config(
        &self,
        request: Request<xbox::FilterConfigRequest>,
    ) -> Result<Response<xbox::FilterConfigResponse>, Status> {
        let req = request.into_inner();

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::FilterConfigResponse {
                success: false,
                message,
                filters: Vec::new(),
                config_version: String::new(),
            }));
        }

        let filters = self.client.get_filter_config(&req.protocol).await;
        let config_version = self.client.filter_version().await;

        Ok(Response::new(xbox::FilterConfigResponse {
            success: true,
            message: "配置查询成功".to_string(),
            filters,
            config_version,
        }))
    }

    async fn update_multiplex_config(
        &self,
        request: Request<xbox::MultiplexConfigRequest>,
    ) -> Result<Response<xbox::MultiplexConfigResponse>, Status> {
        let req = request.into_inner();
        info!("收到多路复用配置更新请求: protocol={}", req.protocol);

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::MultiplexConfigResponse {
                success: false,
                message,
                config_version: String::new(),
            }));
        }

        let Some(multiplex_config) = req.multiplex_config else {
            return Ok(Response::new(xbox::MultiplexConfigResponse {
                success: false,
                message: "缺少多路复用配置".to_string(),
                config_version: String::new(),
            }));
        };

        match self.client.update_multiplex(&req.protocol, &multiplex_config).await {
            Ok(version) => Ok(Response::new(xbox::MultiplexConfigResponse {
                success: true,
                message: "多路复用配置更新成功".to_string(),
                config_version: version,
            })),
            Err(e) => {
                error!("多路复用配置更新失败: {:#}", e);
                Ok(Response::new(xbox::MultiplexConfigResponse {
                    success: false,
                    message: format!("配置更新失败: {:#}", e),
                    config_version: String::new(),
                }))
            }
        }
    }

    async fn get_multiplex_config(
        &self,
        request: Request<xbox::MultiplexStatusRequest>,
    ) -> Result<Response<xbox::MultiplexStatusResponse>, Status> {
        let req = request.into_inner();

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::MultiplexStatusResponse {
                success: false,
                message,
                multiplex_configs: Vec::new(),
            }));
        }

        match self.client.get_multiplex(&req.protocol).await {
            Ok(configs) => Ok(Response::new(xbox::MultiplexStatusResponse {
                success: true,
                message: "获取多路复用配置成功".to_string(),
                multiplex_configs: configs,
            })),
            Err(e) => Ok(Response::new(xbox::MultiplexStatusResponse {
                success: false,
                message: format!("获取配置失败: {:#}", e),
                multiplex_configs: Vec::new(),
            })),
        }
    }

    async fn rollback_config(
        &self,
        request: Request<xbox::RollbackRequest>,
    ) -> Result<Response<xbox::RollbackResponse>, Status> {
        let req = request.into_inner();
        info!(
            "收到配置回滚请求: target={}, reason={}",
            req.target_version, req.reason
        );

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::RollbackResponse {
                success: false,
                message,
                rolled_back_version: String::new(),
                current_version: String::new(),
            }));
        }

        match self.client.rollback(&req.target_version, &req.reason).await {
            Ok((rolled_back, current)) => Ok(Response::new(xbox::RollbackResponse {
                success: true,
                message: "配置回滚成功".to_string(),
                rolled_back_version: rolled_back,
                current_version: current,
            })),
            Err(e) => Ok(Response::new(xbox::RollbackResponse {
                success: false,
                message: format!("配置回滚失败: {:#}", e),
                rolled_back_version: String::new(),
                current_version: self.client.filter_version().await,
            })),
        }
    }

    async fn uninstall(
        &self,
        request: Request<xbox::UninstallRequest>,
    ) -> Result<Response<xbox::UninstallResponse>, Status> {
        let req = request.into_inner();

        if let Some(message) = self.check_agent_id(&req.agent_id) {
            return Ok(Response::new(xbox::UninstallResponse {
                success: false,
                message,
                uninstall_status: String::new(),
                cleaned_files: Vec::new(),
                cleanup_time_ms: 0,
            }));
        }

        let result = self
            .client
            .uninstall(req.force_uninstall, &req.reason, req.timeout_seconds)
            .await;

        Ok(Response::new(xbox::UninstallResponse {
            success: result.success,
            message: result.message,
            uninstall_status: result.status,
            cleaned_files: result.cleaned_files,
            cleanup_time_ms: result.cleanup_time_ms,
        }))
    }
}

/// 启动 Agent gRPC 服务
pub fn start_rpc_server(
    config: Arc<Config>,
    client: Arc<AgentClient>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = match format!("0.0.0.0:{}", config.agent.listen_port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("无效的监听地址: {}", e);
                return;
            }
        };

        let service = AgentServiceServer::new(AgentRpcServer::new(client));
        let mut builder = Server::builder();

        if config.grpc.tls.enabled {
            match load_server_tls(&config) {
                Ok(tls) => {
                    builder = match builder.tls_config(tls) {
                        Ok(b) => {
                            info!("Agent gRPC 服务启动 (TLS): {}", addr);
                            b
                        }
                        Err(e) => {
                            error!("gRPC TLS 配置失败: {}，回退到明文模式", e);
                            warn!("Agent gRPC 服务启动 (明文): {}", addr);
                            Server::builder()
                        }
                    };
                }
                Err(e) => {
                    error!("加载 TLS 证书失败: {}，回退到明文模式", e);
                    warn!("Agent gRPC 服务启动 (明文): {}", addr);
                }
            }
        } else {
            info!("Agent gRPC 服务启动 (明文，仅限实验环境): {}", addr);
        }

        if let Err(e) = builder.add_service(service).serve(addr).await {
            error!("Agent gRPC 服务错误: {}", e);
        }
    })
}

fn load_server_tls(config: &Config) -> Result<ServerTlsConfig> {
    let tls_cfg = &config.grpc.tls;
    let cert = std::fs::read(&tls_cfg.cert_file)
        .with_context(|| format!("读取证书文件失败: {}", tls_cfg.cert_file))?;
    let key = std::fs::read(&tls_cfg.key_file)
        .with_context(|| format!("读取私钥文件失败: {}", tls_cfg.key_file))?;

    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    // 配置了 CA 时启用双向认证
    if !tls_cfg.ca_file.is_empty() {
        let ca = std::fs::read(&tls_cfg.ca_file)
            .with_context(|| format!("读取 CA 证书失败: {}", tls_cfg.ca_file))?;
        tls = tls.client_ca_root(tonic::transport::Certificate::from_pem(ca));
    }

    Ok(tls)
}
