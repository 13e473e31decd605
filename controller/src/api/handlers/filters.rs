use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use common::grpc::xbox;

use crate::{configs, migration::get_connection, oplog, repository, AppState};

use super::ApiResponse;

#[derive(Deserialize)]
pub struct FilterUpdateRequest {
    pub agent_id: String,
    pub protocol: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    pub operation: String,
}

#[derive(Serialize)]
pub struct FilterUpdateResult {
    pub config_version: String,
}

#[derive(Deserialize)]
pub struct ConfigUpdateRequest {
    pub agent_id: String,
    pub config_content: String,
    pub config_version: String,
    #[serde(default)]
    pub force_update: bool,
}

#[derive(Deserialize)]
pub struct RulesUpdateRequest {
    pub agent_id: String,
    pub operation: String,
    pub rules: Vec<RuleEntry>,
}

#[derive(Deserialize)]
pub struct RuleEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub content: String,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct RollbackRequest {
    pub agent_id: String,
    #[serde(default)]
    pub target_version: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Serialize)]
pub struct RollbackResult {
    pub rolled_back_version: String,
    pub current_version: String,
}

/// 校验 Agent 存在且在线
async fn require_online_agent(agent_id: &str) -> Result<(), (StatusCode, String)> {
    let db = get_connection().await;
    match repository::get_by_id(db, agent_id).await {
        Ok(Some(agent)) if agent.status == "online" => Ok(()),
        Ok(Some(agent)) => Err((
            StatusCode::CONFLICT,
            format!("Agent 不在线，当前状态: {}", agent.status),
        )),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            format!("Agent {} 不存在", agent_id),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("查询 Agent 失败: {}", e),
        )),
    }
}

/// POST /api/filters/blacklist — 推送黑名单变更
pub async fn update_blacklist(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<FilterUpdateRequest>,
) -> impl IntoResponse {
    push_filter_update(app_state, req, true).await
}

/// POST /api/filters/whitelist — 推送白名单变更
pub async fn update_whitelist(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<FilterUpdateRequest>,
) -> impl IntoResponse {
    push_filter_update(app_state, req, false).await
}

async fn push_filter_update(
    app_state: AppState,
    req: FilterUpdateRequest,
    blacklist: bool,
) -> (StatusCode, axum::response::Json<ApiResponse<FilterUpdateResult>>) {
    let operation_type = if blacklist {
        "update_blacklist"
    } else {
        "update_whitelist"
    };
    let content = serde_json::json!({
        "agent_id": req.agent_id,
        "protocol": req.protocol,
        "operation": req.operation,
        "domains": req.domains,
        "ips": req.ips,
        "ports": req.ports,
    });

    if let Err((status, message)) = require_online_agent(&req.agent_id).await {
        oplog::record(Some(&req.agent_id), operation_type, content, Some(&message)).await;
        return (status, ApiResponse::error(message));
    }

    let result = if blacklist {
        app_state
            .push
            .update_blacklist(
                &req.agent_id,
                &req.protocol,
                req.domains.clone(),
                req.ips.clone(),
                req.ports.clone(),
                &req.operation,
            )
            .await
    } else {
        app_state
            .push
            .update_whitelist(
                &req.agent_id,
                &req.protocol,
                req.domains.clone(),
                req.ips.clone(),
                req.ports.clone(),
                &req.operation,
            )
            .await
    };

    match result {
        Ok(response) if response.success => {
            oplog::record(Some(&req.agent_id), operation_type, content, None).await;
            app_state.filter_cache.refresh_in_background(&req.agent_id);
            (
                StatusCode::OK,
                ApiResponse::success(FilterUpdateResult {
                    config_version: response.config_version,
                }),
            )
        }
        Ok(response) => {
            let message = format!("push failed: {}", response.message);
            oplog::record(Some(&req.agent_id), operation_type, content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
        Err(e) => {
            let message = format!("push failed: {}", e);
            oplog::record(Some(&req.agent_id), operation_type, content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
    }
}

/// POST /api/configs/update — 推送完整 forwarder 配置
///
/// 推送前把意图落库（pending），推送结果回写 applied / failed。
pub async fn update_config(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<ConfigUpdateRequest>,
) -> impl IntoResponse {
    if let Err((status, message)) = require_online_agent(&req.agent_id).await {
        return (status, ApiResponse::<FilterUpdateResult>::error(message));
    }

    let db = get_connection().await;
    let record = match configs::record_intent(
        db,
        &req.agent_id,
        &req.config_content,
        &req.config_version,
    )
    .await
    {
        Ok(record) => record,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::<FilterUpdateResult>::error(e.to_string()),
            )
        }
    };

    let content = serde_json::json!({
        "agent_id": req.agent_id,
        "config_version": req.config_version,
        "force_update": req.force_update,
    });

    match app_state
        .push
        .update_config(&req.agent_id, &req.config_content, &req.config_version, req.force_update)
        .await
    {
        Ok(response) if response.success => {
            if let Err(e) = configs::mark_applied(db, record).await {
                tracing::warn!("回写配置下发记录失败: {}", e);
            }
            oplog::record(Some(&req.agent_id), "update_config", content, None).await;
            (
                StatusCode::OK,
                ApiResponse::success(FilterUpdateResult {
                    config_version: response.applied_version,
                }),
            )
        }
        Ok(response) => {
            let message = format!("push failed: {}", response.message);
            if let Err(e) = configs::mark_failed(db, record, &message).await {
                tracing::warn!("回写配置下发记录失败: {}", e);
            }
            oplog::record(Some(&req.agent_id), "update_config", content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
        Err(e) => {
            let message = format!("push failed: {}", e);
            if let Err(e) = configs::mark_failed(db, record, &message).await {
                tracing::warn!("回写配置下发记录失败: {}", e);
            }
            oplog::record(Some(&req.agent_id), "update_config", content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
    }
}

/// POST /api/rules/update — 推送规则变更
pub async fn update_rules(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<RulesUpdateRequest>,
) -> impl IntoResponse {
    if let Err((status, message)) = require_online_agent(&req.agent_id).await {
        return (status, ApiResponse::<()>::error(message));
    }

    let content = serde_json::json!({
        "agent_id": req.agent_id,
        "operation": req.operation,
        "rule_count": req.rules.len(),
    });

    let rules: Vec<xbox::Rule> = req
        .rules
        .into_iter()
        .map(|r| xbox::Rule {
            id: r.id,
            r#type: r.rule_type,
            priority: r.priority,
            enabled: r.enabled,
            content: r.content,
        })
        .collect();

    match app_state
        .push
        .update_rules(&req.agent_id, &req.operation, rules)
        .await
    {
        Ok(response) if response.success => {
            oplog::record(Some(&req.agent_id), "update_rules", content, None).await;
            (StatusCode::OK, ApiResponse::success(()))
        }
        Ok(response) => {
            let message = format!("push failed: {}", response.message);
            oplog::record(Some(&req.agent_id), "update_rules", content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
        Err(e) => {
            let message = format!("push failed: {}", e);
            oplog::record(Some(&req.agent_id), "update_rules", content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
    }
}

/// POST /api/filters/rollback — 推送回滚请求
pub async fn rollback_config(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<RollbackRequest>,
) -> impl IntoResponse {
    if let Err((status, message)) = require_online_agent(&req.agent_id).await {
        return (status, ApiResponse::<RollbackResult>::error(message));
    }

    let content = serde_json::json!({
        "agent_id": req.agent_id,
        "target_version": req.target_version,
        "reason": req.reason,
    });

    match app_state
        .push
        .rollback_config(&req.agent_id, &req.target_version, &req.reason)
        .await
    {
        Ok(response) if response.success => {
            oplog::record(Some(&req.agent_id), "rollback_config", content, None).await;
            app_state.filter_cache.refresh_in_background(&req.agent_id);
            (
                StatusCode::OK,
                ApiResponse::success(RollbackResult {
                    rolled_back_version: response.rolled_back_version,
                    current_version: response.current_version,
                }),
            )
        }
        Ok(response) => {
            let message = format!("push failed: {}", response.message);
            oplog::record(Some(&req.agent_id), "rollback_config", content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
        Err(e) => {
            let message = format!("push failed: {}", e);
            oplog::record(Some(&req.agent_id), "rollback_config", content, Some(&message)).await;
            (StatusCode::BAD_GATEWAY, ApiResponse::error(message))
        }
    }
}
