use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use crate::{entity::agent, migration::get_connection, repository, AppState};

use super::ApiResponse;

/// GET /api/agents — 列出全部节点
pub async fn list_agents() -> impl IntoResponse {
    let db = get_connection().await;
    match repository::list_all(db).await {
        Ok(agents) => (StatusCode::OK, ApiResponse::success(agents)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse::<Vec<agent::Model>>::error(format!("查询节点列表失败: {}", e)),
        ),
    }
}

/// GET /api/agents/{id} — 节点详情
pub async fn get_agent(Path(id): Path<String>) -> impl IntoResponse {
    let db = get_connection().await;
    match repository::get_by_id(db, &id).await {
        Ok(Some(agent)) => (StatusCode::OK, ApiResponse::success(agent)),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            ApiResponse::<agent::Model>::error(format!("Agent {} 不存在", id)),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse::<agent::Model>::error(format!("查询节点失败: {}", e)),
        ),
    }
}

/// DELETE /api/agents/{id} — 删除节点记录
pub async fn delete_agent(
    Path(id): Path<String>,
    Extension(app_state): Extension<AppState>,
) -> impl IntoResponse {
    let db = get_connection().await;
    let result = repository::delete(db, &id).await;

    let error = result.as_ref().err().map(|e| e.to_string());
    crate::oplog::record(
        Some(&id),
        "delete_agent",
        serde_json::json!({ "agent_id": id }),
        error.as_deref(),
    )
    .await;

    match result {
        Ok(()) => {
            app_state.filter_cache.evict(&id).await;
            (StatusCode::OK, ApiResponse::success(()))
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::error(e.to_string()),
        ),
    }
}

/// GET /api/agents/{id}/filters — 查询节点的过滤器配置
///
/// 优先实时向 Agent 查询并刷新快照缓存，Agent 不可达时退回最近一次快照。
pub async fn get_agent_filters(
    Path(id): Path<String>,
    Extension(app_state): Extension<AppState>,
) -> impl IntoResponse {
    if let Some(snapshot) = app_state.filter_cache.refresh(&id).await {
        return (StatusCode::OK, ApiResponse::success(snapshot));
    }

    match app_state.filter_cache.get(&id).await {
        Some(snapshot) => (StatusCode::OK, ApiResponse::success(snapshot)),
        None => (
            StatusCode::BAD_GATEWAY,
            ApiResponse::error(format!("push failed: Agent {} 不可达且无缓存快照", id)),
        ),
    }
}
