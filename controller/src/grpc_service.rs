//! ControllerService gRPC 实现
//!
//! 注册与心跳入口。状态为 uninstalling 且携带 uninstall_* 指标的心跳
//! 被识别为卸载结果上报，分流给卸载服务处理，不走常规心跳路径。

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use common::grpc::xbox;
use common::grpc::ControllerService;

use crate::migration::get_connection;
use crate::registry;
use crate::uninstall::{UninstallReport, UninstallService};

pub struct ControllerServiceImpl {
    pub uninstall: Arc<UninstallService>,
}

#[tonic::async_trait]
impl ControllerService for ControllerServiceImpl {
    async fn register_agent(
        &self,
        request: Request<xbox::RegisterRequest>,
    ) -> Result<Response<xbox::RegisterResponse>, Status> {
        let req = request.into_inner();
        info!(
            "Agent 注册请求: id={}, hostname={}, ip={}",
            req.agent_id, req.hostname, req.ip_address
        );

        let db = get_connection().await;
        let response = registry::register_agent(db, &req).await;

        if !response.success {
            warn!("Agent {} 注册失败: {}", req.agent_id, response.message);
        }
        Ok(Response::new(response))
    }

    async fn heartbeat(
        &self,
        request: Request<xbox::HeartbeatRequest>,
    ) -> Result<Response<xbox::HeartbeatResponse>, Status> {
        let req = request.into_inner();

        // 卸载结果以心跳形式上报，先行分流
        if req.status == "uninstalling" && UninstallReport::from_metrics(&req.metrics).is_some() {
            info!("收到 Agent {} 卸载状态上报", req.agent_id);
            let response = match self.uninstall.process_report(&req.agent_id, &req.metrics).await {
                Ok(()) => xbox::HeartbeatResponse {
                    success: true,
                    message: "卸载状态已记录".to_string(),
                    next_heartbeat_interval: registry::HEARTBEAT_INTERVAL_SECS,
                },
                Err(e) => {
                    warn!("处理 Agent {} 卸载上报失败: {}", req.agent_id, e);
                    xbox::HeartbeatResponse {
                        success: false,
                        message: e.to_string(),
                        next_heartbeat_interval: registry::HEARTBEAT_INTERVAL_SECS,
                    }
                }
            };
            return Ok(Response::new(response));
        }

        let db = get_connection().await;
        let response = registry::process_heartbeat(db, &req).await;
        if !response.success {
            warn!("Agent {} 心跳被拒绝: {}", req.agent_id, response.message);
        }
        Ok(Response::new(response))
    }
}
