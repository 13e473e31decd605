use axum::{extract::Extension, http::StatusCode, response::IntoResponse};

use crate::report::ReportStats;
use crate::AppState;

use super::ApiResponse;

/// POST /api/report/trigger — 立即执行一次上报
pub async fn trigger_report(Extension(app_state): Extension<AppState>) -> impl IntoResponse {
    let Some(report) = &app_state.report else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::<()>::error("上报服务未启用".to_string()),
        );
    };

    match report.report_once().await {
        Ok(()) => (StatusCode::OK, ApiResponse::success(())),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            ApiResponse::<()>::error(format!("上报失败: {}", e)),
        ),
    }
}

/// GET /api/report/stats — 当前节点群统计
pub async fn report_stats(Extension(app_state): Extension<AppState>) -> impl IntoResponse {
    let Some(report) = &app_state.report else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::<ReportStats>::error("上报服务未启用".to_string()),
        );
    };

    match report.stats().await {
        Ok(stats) => (StatusCode::OK, ApiResponse::success(stats)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse::<ReportStats>::error(format!("收集统计失败: {}", e)),
        ),
    }
}
