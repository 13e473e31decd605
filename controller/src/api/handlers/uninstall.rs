use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::uninstall::UninstallTask;
use crate::AppState;

use super::ApiResponse;

#[derive(Deserialize)]
pub struct UninstallInitiateRequest {
    pub ip: String,
    #[serde(default)]
    pub force_uninstall: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub delete_from_db: bool,
}

/// POST /api/uninstall — 按节点 IP 发起卸载
pub async fn initiate_uninstall(
    Extension(app_state): Extension<AppState>,
    Json(req): Json<UninstallInitiateRequest>,
) -> impl IntoResponse {
    let content = serde_json::json!({
        "ip": req.ip,
        "force_uninstall": req.force_uninstall,
        "reason": req.reason,
        "timeout_seconds": req.timeout_seconds,
        "delete_from_db": req.delete_from_db,
    });

    match app_state
        .uninstall
        .initiate(
            &req.ip,
            req.force_uninstall,
            &req.reason,
            req.timeout_seconds,
            req.delete_from_db,
        )
        .await
    {
        Ok(task) => {
            crate::oplog::record(Some(&task.agent_id), "initiate_uninstall", content, None).await;
            (StatusCode::OK, ApiResponse::success(task))
        }
        Err(e) => {
            let message = e.to_string();
            crate::oplog::record(None, "initiate_uninstall", content, Some(&message)).await;
            (
                StatusCode::BAD_REQUEST,
                ApiResponse::<UninstallTask>::error(message),
            )
        }
    }
}

/// GET /api/uninstall/tasks — 全部卸载任务
pub async fn list_uninstall_tasks(
    Extension(app_state): Extension<AppState>,
) -> impl IntoResponse {
    let tasks = app_state.uninstall.list_tasks().await;
    (StatusCode::OK, ApiResponse::success(tasks))
}

/// GET /api/uninstall/tasks/{agent_id} — 单个卸载任务状态
pub async fn get_uninstall_task(
    Path(agent_id): Path<String>,
    Extension(app_state): Extension<AppState>,
) -> impl IntoResponse {
    match app_state.uninstall.get_task(&agent_id).await {
        Some(task) => (StatusCode::OK, ApiResponse::success(task)),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::<UninstallTask>::error(format!("未找到 Agent {} 的卸载任务", agent_id)),
        ),
    }
}
