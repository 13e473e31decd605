use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::multiplex::{batch_status_code, BatchEntryResult, MultiplexUpdate};
use crate::{entity::multiplex_config, AppState};

use super::ApiResponse;

#[derive(Serialize)]
pub struct MultiplexUpdateResult {
    pub config_version: String,
}

#[derive(Deserialize)]
pub struct BatchUpdateRequest {
    pub configs: Vec<MultiplexUpdate>,
}

#[derive(Serialize)]
pub struct BatchUpdateResult {
    pub results: Vec<BatchEntryResult>,
}

#[derive(Deserialize)]
pub struct MultiplexQuery {
    #[serde(default)]
    pub protocol: String,
    /// true 时绕过落库配置，直接向 Agent 查询生效中的配置
    #[serde(default)]
    pub live: bool,
}

/// POST /api/multiplex/update — 更新单条多路复用配置
pub async fn update_multiplex(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<MultiplexUpdate>,
) -> impl IntoResponse {
    let agent_id = req.agent_id.clone();
    let content = serde_json::json!({
        "agent_id": req.agent_id,
        "protocol": req.protocol,
        "enabled": req.enabled,
        "max_connections": req.max_connections,
        "min_streams": req.min_streams,
    });

    match app_state.multiplex.update(req).await {
        Ok(version) => {
            crate::oplog::record(Some(&agent_id), "update_multiplex", content, None).await;
            (
                StatusCode::OK,
                ApiResponse::success(MultiplexUpdateResult {
                    config_version: version,
                }),
            )
        }
        Err(e) => {
            let message = e.to_string();
            crate::oplog::record(Some(&agent_id), "update_multiplex", content, Some(&message))
                .await;
            (
                StatusCode::BAD_REQUEST,
                ApiResponse::<MultiplexUpdateResult>::error(message),
            )
        }
    }
}

/// POST /api/multiplex/batch — 批量更新
///
/// 聚合状态：全部成功 200，部分成功 206，全部失败 500。
pub async fn batch_update_multiplex(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<BatchUpdateRequest>,
) -> impl IntoResponse {
    let results = app_state.multiplex.batch_update(req.configs).await;
    let status = StatusCode::from_u16(batch_status_code(&results))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, ApiResponse::success(BatchUpdateResult { results }))
}

/// GET /api/multiplex/{agent_id}?protocol=&live= — 查询多路复用配置
///
/// 默认读落库配置；live=true 时实时向 Agent 查询生效中的配置。
pub async fn get_multiplex(
    Path(agent_id): Path<String>,
    Query(query): Query<MultiplexQuery>,
    Extension(app_state): Extension<AppState>,
) -> axum::response::Response {
    if query.live {
        return match app_state
            .push
            .get_multiplex_config(&agent_id, &query.protocol)
            .await
        {
            Ok(response) if response.success => {
                (StatusCode::OK, ApiResponse::success(response.multiplex_configs)).into_response()
            }
            Ok(response) => (
                StatusCode::BAD_GATEWAY,
                ApiResponse::<()>::error(format!("push failed: {}", response.message)),
            )
                .into_response(),
            Err(e) => (
                StatusCode::BAD_GATEWAY,
                ApiResponse::<()>::error(format!("push failed: {}", e)),
            )
                .into_response(),
        };
    }

    match app_state.multiplex.get(&agent_id, &query.protocol).await {
        Ok(configs) => (StatusCode::OK, ApiResponse::success(configs)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse::<Vec<multiplex_config::Model>>::error(e.to_string()),
        )
            .into_response(),
    }
}
