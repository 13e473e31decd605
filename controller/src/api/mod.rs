//! 管理 HTTP 服务
//!
//! 薄封装：每个路由直接映射到核心操作（注册表查询、过滤器/配置/多路复用推送、
//! 卸载编排、上游上报）。

use axum::routing::{get, post};
use axum::{Extension, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppState;

pub mod handlers;

/// 启动 Web API 服务
pub fn start_web_server(app_state: AppState) -> tokio::task::JoinHandle<()> {
    let addr = app_state.config.server_addr();

    tokio::spawn(async move {
        let api_routes = Router::new()
            // 节点管理
            .route("/agents", get(handlers::list_agents))
            .route(
                "/agents/{id}",
                get(handlers::get_agent).delete(handlers::delete_agent),
            )
            .route("/agents/{id}/filters", get(handlers::get_agent_filters))
            // 过滤器推送
            .route("/filters/blacklist", post(handlers::update_blacklist))
            .route("/filters/whitelist", post(handlers::update_whitelist))
            .route("/filters/rollback", post(handlers::rollback_config))
            // 配置与规则推送
            .route("/configs/update", post(handlers::update_config))
            .route("/rules/update", post(handlers::update_rules))
            // 多路复用
            .route("/multiplex/update", post(handlers::update_multiplex))
            .route("/multiplex/batch", post(handlers::batch_update_multiplex))
            .route("/multiplex/{agent_id}", get(handlers::get_multiplex))
            // 卸载
            .route("/uninstall", post(handlers::initiate_uninstall))
            .route("/uninstall/tasks", get(handlers::list_uninstall_tasks))
            .route("/uninstall/tasks/{agent_id}", get(handlers::get_uninstall_task))
            // 上游上报
            .route("/report/trigger", post(handlers::trigger_report))
            .route("/report/stats", get(handlers::report_stats))
            .layer(Extension(app_state));

        let app = Router::new()
            .nest("/api", api_routes)
            .layer(CorsLayer::permissive());

        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("🌐 管理 API: http://{}", addr);
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!("Web 服务错误：{}", err);
                }
            }
            Err(err) => {
                tracing::error!("Web 服务启动失败：{}", err);
            }
        }
    })
}
