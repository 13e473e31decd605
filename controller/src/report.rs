//! 上游节点信息上报
//!
//! 周期性把整个节点群的状态汇总 POST 到后端
//! `<backend_url>/api/ip-pool/report`。HTTP 200 且响应体 code == 200 视为成功，
//! 单次失败按配置重试，仍失败则记录日志等下个周期。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use common::config::Config;

use crate::entity::agent;
use crate::migration::get_connection;
use crate::repository;

#[derive(Debug, Serialize)]
pub struct ReportRequest {
    pub report_time: DateTime<Utc>,
    pub controller: ControllerInfo,
    pub nodes: Vec<NodeInfo>,
    pub stats: ReportStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    pub controller_id: String,
    pub version: String,
    pub address: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub agent_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub ip_range: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub status: String,
    pub last_heartbeat: Option<chrono::NaiveDateTime>,
    pub version: String,
    pub port_range: String,
    pub bandwidth_mbps: i32,
    pub ip_quality: String,
    pub provider: String,
    pub supported_protocols: String,
    pub metadata: String,
}

#[derive(Debug, Default, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub error_nodes: usize,
    pub total_ip_ranges: usize,
}

#[derive(Debug, Deserialize)]
struct BackendResponse {
    code: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: String,
}

#[derive(Clone)]
pub struct ReportService {
    config: Arc<Config>,
    client: reqwest::Client,
}

impl ReportService {
    pub fn new(config: Arc<Config>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.report.timeout))
            .user_agent("Xbox-Controller/1.0")
            .build()
            .expect("failed to build http client");

        Self { config, client }
    }

    /// 执行一次上报（带重试）
    pub async fn report_once(&self) -> Result<()> {
        let (nodes, stats) = self.collect().await?;
        let request = ReportRequest {
            report_time: Utc::now(),
            controller: ControllerInfo {
                controller_id: self.config.report.controller_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                address: self.config.server_addr(),
                status: "running".to_string(),
            },
            nodes,
            stats,
        };

        let mut last_err = None;
        for attempt in 0..=self.config.report.retry_count {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(self.config.report.retry_delay)).await;
                debug!("节点上报重试: 第 {} 次", attempt);
            }
            match self.send(&request).await {
                Ok(()) => {
                    info!("节点信息上报成功，上报节点数: {}", request.nodes.len());
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("上报失败")))
    }

    /// 收集节点信息与统计
    pub async fn collect(&self) -> Result<(Vec<NodeInfo>, ReportStats)> {
        let db = get_connection().await;
        let agents = repository::list_all(db).await?;

        let mut stats = ReportStats {
            total_nodes: agents.len(),
            ..Default::default()
        };
        let mut ip_ranges = std::collections::HashSet::new();
        let mut nodes = Vec::with_capacity(agents.len());

        for agent in agents {
            match agent.status.as_str() {
                "online" => stats.online_nodes += 1,
                "offline" => stats.offline_nodes += 1,
                "error" => stats.error_nodes += 1,
                _ => {}
            }
            if !agent.ip_range.is_empty() {
                ip_ranges.insert(agent.ip_range.clone());
            }
            nodes.push(node_info_of(agent));
        }

        stats.total_ip_ranges = ip_ranges.len();
        Ok((nodes, stats))
    }

    pub async fn stats(&self) -> Result<ReportStats> {
        Ok(self.collect().await?.1)
    }

    async fn send(&self, request: &ReportRequest) -> Result<()> {
        let url = format!("{}/api/ip-pool/report", self.config.report.backend_url);
        debug!("发送节点信息上报请求到: {}", url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("发送上报请求失败: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("后端返回错误状态: {}", response.status()));
        }

        let body: BackendResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("解析上报响应失败: {}", e))?;

        if body.code != 200 {
            return Err(anyhow!("后端处理失败: {}", body.message));
        }

        debug!("上报响应: {}", body.data);
        Ok(())
    }

    /// 启动周期上报任务
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(service.config.report.interval));

            loop {
                interval.tick().await;
                if let Err(e) = service.report_once().await {
                    error!("节点信息上报失败: {}", e);
                }
            }
        })
    }
}

fn node_info_of(agent: agent::Model) -> NodeInfo {
    let metadata = agent
        .metadata
        .as_ref()
        .map(|m| m.to_string())
        .unwrap_or_default();
    let provider = if agent.isp.is_empty() {
        "Xbox-Provider".to_string()
    } else {
        agent.isp.clone()
    };

    NodeInfo {
        agent_id: agent.id,
        hostname: agent.hostname,
        ip_address: agent.ip_address,
        ip_range: agent.ip_range,
        country: agent.country,
        region: agent.region,
        city: agent.city,
        isp: agent.isp,
        status: agent.status,
        last_heartbeat: agent.last_heartbeat,
        version: agent.version,
        port_range: "8000-8999".to_string(),
        bandwidth_mbps: 1000,
        ip_quality: "standard".to_string(),
        provider,
        supported_protocols: "HTTP,SOCKS5,Shadowsocks,VMess,Trojan,VLESS".to_string(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_payload_field_names() {
        let request = ReportRequest {
            report_time: Utc::now(),
            controller: ControllerInfo {
                controller_id: "xbox-controller-001".to_string(),
                version: "0.1.0".to_string(),
                address: "0.0.0.0:8080".to_string(),
                status: "running".to_string(),
            },
            nodes: vec![NodeInfo {
                agent_id: "a1".to_string(),
                hostname: "h1".to_string(),
                ip_address: "10.0.0.1".to_string(),
                ip_range: "10.0.0.0/24".to_string(),
                country: "CN".to_string(),
                region: "Beijing".to_string(),
                city: "Beijing".to_string(),
                isp: "CT".to_string(),
                status: "online".to_string(),
                last_heartbeat: None,
                version: "0.1.0".to_string(),
                port_range: "8000-8999".to_string(),
                bandwidth_mbps: 1000,
                ip_quality: "standard".to_string(),
                provider: "CT".to_string(),
                supported_protocols: "HTTP,SOCKS5".to_string(),
                metadata: String::new(),
            }],
            stats: ReportStats {
                total_nodes: 1,
                online_nodes: 1,
                offline_nodes: 0,
                error_nodes: 0,
                total_ip_ranges: 1,
            },
        };

        // 后端约定的字段名：外层 snake_case，controller/nodes/stats 内 camelCase
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("report_time").is_some());
        assert_eq!(value["controller"]["controllerId"], "xbox-controller-001");
        assert_eq!(value["nodes"][0]["agentId"], "a1");
        assert_eq!(value["nodes"][0]["ipAddress"], "10.0.0.1");
        assert_eq!(value["nodes"][0]["ipRange"], "10.0.0.0/24");
        assert_eq!(value["nodes"][0]["supportedProtocols"], "HTTP,SOCKS5");
        assert_eq!(value["stats"]["totalNodes"], 1);
        assert_eq!(value["stats"]["totalIpRanges"], 1);
    }
}
