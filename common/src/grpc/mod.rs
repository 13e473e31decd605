// 导出 proto 生成的代码
pub mod xbox {
    tonic::include_proto!("xbox");
}

// 重新导出常用类型
pub use xbox::*;
pub use xbox::agent_service_client::AgentServiceClient;
pub use xbox::agent_service_server::{AgentService, AgentServiceServer};
pub use xbox::controller_service_client::ControllerServiceClient;
pub use xbox::controller_service_server::{ControllerService, ControllerServiceServer};
