//! Agent 注册与心跳状态机
//!
//! register: 新建或覆盖节点记录并颁发新令牌（重注册总是被接受）。
//! heartbeat: 要求记录已存在，刷新 online 状态与心跳时间，吸收指标。
//! liveness sweep: 周期扫描超时未心跳的 online 节点并降为 offline，
//! uninstalling 状态不受扫描影响。

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use tracing::{info, warn};
use uuid::Uuid;

use common::grpc::xbox;

use crate::entity::agent;
use crate::repository;

/// 心跳间隔（秒），Heartbeat 响应回传给 Agent
pub const HEARTBEAT_INTERVAL_SECS: i64 = 30;
/// 超过该时长未心跳即判定离线
pub const MAX_OFFLINE_SECS: i64 = 300;

/// 处理注册请求
pub async fn register_agent(
    db: &DatabaseConnection,
    req: &xbox::RegisterRequest,
) -> xbox::RegisterResponse {
    if req.agent_id.is_empty() {
        return xbox::RegisterResponse {
            success: false,
            message: "empty_id".to_string(),
            token: String::new(),
        };
    }

    let token = Uuid::new_v4().to_string();
    let now = Utc::now().naive_utc();
    let metadata = (!req.metadata.is_empty()).then(|| serde_json::json!(req.metadata));

    let existing = match repository::get_by_id(db, &req.agent_id).await {
        Ok(existing) => existing,
        Err(e) => {
            return xbox::RegisterResponse {
                success: false,
                message: format!("查询 Agent 失败: {}", e),
                token: String::new(),
            }
        }
    };

    let result = match existing {
        Some(model) => {
            // 重注册：覆盖节点信息，颁发新令牌
            let mut active: agent::ActiveModel = model.into();
            active.hostname = Set(req.hostname.clone());
            active.ip_address = Set(req.ip_address.clone());
            active.rpc_port = Set(req.rpc_port as i32);
            active.version = Set(req.version.clone());
            active.status = Set("online".to_string());
            active.token = Set(token.clone());
            active.last_heartbeat = Set(Some(now));
            active.updated_at = Set(now);
            if let Some(info) = &req.ip_range_info {
                active.ip_range = Set(info.ip_range.clone());
                active.country = Set(info.country.clone());
                active.region = Set(info.region.clone());
                active.city = Set(info.city.clone());
                active.isp = Set(info.isp.clone());
            }
            if metadata.is_some() {
                active.metadata = Set(metadata);
            }
            active.update(db).await.map(|_| "Agent 重新注册成功")
        }
        None => {
            let info = req.ip_range_info.clone().unwrap_or_default();
            let active = agent::ActiveModel {
                id: Set(req.agent_id.clone()),
                hostname: Set(req.hostname.clone()),
                ip_address: Set(req.ip_address.clone()),
                rpc_port: Set(req.rpc_port as i32),
                ip_range: Set(info.ip_range),
                country: Set(info.country),
                region: Set(info.region),
                city: Set(info.city),
                isp: Set(info.isp),
                version: Set(req.version.clone()),
                status: Set("online".to_string()),
                token: Set(token.clone()),
                last_heartbeat: Set(Some(now)),
                current_connections: Set(0),
                cpu_usage: Set(0.0),
                memory_usage: Set(0.0),
                disk_usage: Set(0.0),
                network_latency: Set(0),
                metadata: Set(metadata),
                created_at: Set(now),
                updated_at: Set(now),
            };
            active.insert(db).await.map(|_| "Agent 注册成功")
        }
    };

    match result {
        Ok(message) => {
            info!("Agent {} 注册成功: {} ({})", req.agent_id, req.hostname, req.ip_address);
            xbox::RegisterResponse {
                success: true,
                message: message.to_string(),
                token,
            }
        }
        Err(e) => xbox::RegisterResponse {
            success: false,
            message: format!("保存 Agent 失败: {}", e),
            token: String::new(),
        },
    }
}

/// 处理常规心跳（卸载报告在 grpc_service 层先行分流）
pub async fn process_heartbeat(
    db: &DatabaseConnection,
    req: &xbox::HeartbeatRequest,
) -> xbox::HeartbeatResponse {
    if req.agent_id.is_empty() {
        return heartbeat_error("empty_id");
    }

    let agent = match repository::get_by_id(db, &req.agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return heartbeat_error("unknown_agent, please re-register"),
        Err(e) => return heartbeat_error(&format!("查询 Agent 失败: {}", e)),
    };

    // 携带令牌时校验，不匹配要求重新注册
    if let Some(token) = &req.token {
        if !agent.token.is_empty() && agent.token != *token {
            return heartbeat_error("invalid token, please re-register");
        }
    }

    let now = Utc::now().naive_utc();
    let mut active: agent::ActiveModel = agent.into();
    active.status = Set("online".to_string());
    active.last_heartbeat = Set(Some(now));
    active.updated_at = Set(now);

    // 合并可选的地理位置更新
    if let Some(info) = &req.ip_range_info {
        active.ip_range = Set(info.ip_range.clone());
        active.country = Set(info.country.clone());
        active.region = Set(info.region.clone());
        active.city = Set(info.city.clone());
        active.isp = Set(info.isp.clone());
    }

    // 吸收指标映射中识别的资源指标
    if let Some(v) = parse_metric(&req.metrics, "cpu_usage") {
        active.cpu_usage = Set(v);
    }
    if let Some(v) = parse_metric(&req.metrics, "memory_usage") {
        active.memory_usage = Set(v);
    }
    if let Some(v) = parse_metric(&req.metrics, "disk_usage") {
        active.disk_usage = Set(v);
    }
    if let Some(v) = parse_metric(&req.metrics, "current_connections") {
        active.current_connections = Set(v as i32);
    }
    if let Some(v) = parse_metric(&req.metrics, "network_latency") {
        active.network_latency = Set(v as i32);
    }

    if let Err(e) = active.update(db).await {
        return heartbeat_error(&format!("更新心跳失败: {}", e));
    }

    xbox::HeartbeatResponse {
        success: true,
        message: "心跳处理成功".to_string(),
        next_heartbeat_interval: HEARTBEAT_INTERVAL_SECS,
    }
}

fn heartbeat_error(message: &str) -> xbox::HeartbeatResponse {
    xbox::HeartbeatResponse {
        success: false,
        message: message.to_string(),
        next_heartbeat_interval: HEARTBEAT_INTERVAL_SECS,
    }
}

fn parse_metric(metrics: &std::collections::HashMap<String, String>, key: &str) -> Option<f64> {
    metrics.get(key).and_then(|v| v.parse::<f64>().ok())
}

/// 执行一次 liveness 扫描，返回降为 offline 的节点数
pub async fn sweep_offline(db: &DatabaseConnection) -> Result<usize> {
    let stale = repository::stale_online_agents(db, Duration::seconds(MAX_OFFLINE_SECS)).await?;
    let mut demoted = 0;

    for agent in stale {
        // uninstalling 不在扫描范围（查询只取 online），这里再兜一道
        if agent.status != "online" {
            continue;
        }
        let id = agent.id.clone();
        if let Err(e) = repository::update_status(db, &id, "offline").await {
            warn!("更新 Agent {} 状态失败: {}", id, e);
            continue;
        }
        warn!("Agent {} 心跳超时，已标记为 offline", id);
        demoted += 1;
    }

    Ok(demoted)
}

/// 启动 liveness 扫描后台任务
pub fn start_liveness_sweep() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(HEARTBEAT_INTERVAL_SECS as u64));

        loop {
            interval.tick().await;
            let db = crate::migration::get_connection().await;
            match sweep_offline(db).await {
                Ok(0) => {}
                Ok(n) => info!("liveness 扫描完成，{} 个节点降为 offline", n),
                Err(e) => warn!("liveness 扫描失败: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{Database, EntityTrait};
    use sea_orm_migration::MigratorTrait;

    use crate::entity::Agent;
    use crate::migration::Migrator;

    async fn memory_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        db
    }

    fn register_request(agent_id: &str) -> xbox::RegisterRequest {
        xbox::RegisterRequest {
            agent_id: agent_id.to_string(),
            hostname: "h1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            version: "0.1.0".to_string(),
            metadata: Default::default(),
            ip_range_info: Some(xbox::IpRangeInfo {
                ip_range: "10.0.0.0/24".to_string(),
                country: "CN".to_string(),
                region: "Beijing".to_string(),
                city: "Beijing".to_string(),
                isp: "CT".to_string(),
                detection_method: "auto".to_string(),
                detected_at: String::new(),
            }),
            rpc_port: 9091,
        }
    }

    fn heartbeat_request(agent_id: &str, token: Option<String>) -> xbox::HeartbeatRequest {
        let mut metrics = std::collections::HashMap::new();
        metrics.insert("cpu_usage".to_string(), "12.5".to_string());
        metrics.insert("memory_usage".to_string(), "1048576".to_string());
        xbox::HeartbeatRequest {
            agent_id: agent_id.to_string(),
            status: "online".to_string(),
            metrics,
            ip_range_info: None,
            token,
        }
    }

    #[tokio::test]
    async fn test_register_creates_online_record() {
        let db = memory_db().await;
        let response = register_agent(&db, &register_request("a1")).await;
        assert!(response.success);
        assert!(!response.token.is_empty());

        let agent = Agent::find_by_id("a1").one(&db).await.unwrap().unwrap();
        assert_eq!(agent.status, "online");
        assert_eq!(agent.hostname, "h1");
        assert_eq!(agent.ip_range, "10.0.0.0/24");
        assert!(agent.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_register_empty_id_rejected() {
        let db = memory_db().await;
        let response = register_agent(&db, &register_request("")).await;
        assert!(!response.success);
        assert_eq!(response.message, "empty_id");
    }

    #[tokio::test]
    async fn test_reregister_overwrites_and_rotates_token() {
        let db = memory_db().await;
        let first = register_agent(&db, &register_request("a1")).await;

        let mut req = register_request("a1");
        req.hostname = "h2".to_string();
        req.ip_address = "10.0.0.2".to_string();
        let second = register_agent(&db, &req).await;

        assert!(second.success);
        assert_ne!(first.token, second.token);

        let agent = Agent::find_by_id("a1").one(&db).await.unwrap().unwrap();
        assert_eq!(agent.hostname, "h2");
        assert_eq!(agent.ip_address, "10.0.0.2");
        assert_eq!(agent.token, second.token);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent() {
        let db = memory_db().await;
        let response = process_heartbeat(&db, &heartbeat_request("ghost", None)).await;
        assert!(!response.success);
        assert_eq!(response.message, "unknown_agent, please re-register");
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_and_absorbs_metrics() {
        let db = memory_db().await;
        let registered = register_agent(&db, &register_request("a1")).await;

        let response =
            process_heartbeat(&db, &heartbeat_request("a1", Some(registered.token))).await;
        assert!(response.success);
        assert_eq!(response.next_heartbeat_interval, HEARTBEAT_INTERVAL_SECS);

        let agent = Agent::find_by_id("a1").one(&db).await.unwrap().unwrap();
        assert_eq!(agent.status, "online");
        assert_eq!(agent.cpu_usage, 12.5);
        assert_eq!(agent.memory_usage, 1048576.0);
    }

    #[tokio::test]
    async fn test_heartbeat_wrong_token_rejected() {
        let db = memory_db().await;
        register_agent(&db, &register_request("a1")).await;

        let response =
            process_heartbeat(&db, &heartbeat_request("a1", Some("bogus".to_string()))).await;
        assert!(!response.success);
        assert!(response.message.contains("re-register"));
    }

    #[tokio::test]
    async fn test_sweep_demotes_stale_online_only() {
        let db = memory_db().await;
        register_agent(&db, &register_request("stale")).await;
        register_agent(&db, &register_request("fresh")).await;
        let mut req = register_request("removing");
        req.ip_address = "10.0.0.3".to_string();
        register_agent(&db, &req).await;

        // stale 的心跳回拨到超时之前
        let past = (Utc::now() - Duration::seconds(MAX_OFFLINE_SECS + 60)).naive_utc();
        for id in ["stale", "removing"] {
            let model = Agent::find_by_id(id).one(&db).await.unwrap().unwrap();
            let mut active: agent::ActiveModel = model.into();
            active.last_heartbeat = Set(Some(past));
            active.update(&db).await.unwrap();
        }
        // removing 处于 uninstalling，扫描不得触碰
        crate::repository::update_status(&db, "removing", "uninstalling")
            .await
            .unwrap();

        let demoted = sweep_offline(&db).await.unwrap();
        assert_eq!(demoted, 1);

        let stale = Agent::find_by_id("stale").one(&db).await.unwrap().unwrap();
        assert_eq!(stale.status, "offline");
        let fresh = Agent::find_by_id("fresh").one(&db).await.unwrap().unwrap();
        assert_eq!(fresh.status, "online");
        let removing = Agent::find_by_id("removing").one(&db).await.unwrap().unwrap();
        assert_eq!(removing.status, "uninstalling");
    }
}
