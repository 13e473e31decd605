//! gRPC Server 启动
//!
//! 在 grpc 端口上提供 ControllerService。支持 TLS（证书文件 + 可选客户端 CA
//! 双向认证）；未启用时走明文并在日志里显式标注，仅限实验环境。

use std::sync::Arc;

use anyhow::{Context, Result};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info, warn};

use common::config::Config;
use common::grpc::ControllerServiceServer;

use crate::grpc_service::ControllerServiceImpl;
use crate::uninstall::UninstallService;

fn load_tls_config(config: &Config) -> Result<ServerTlsConfig> {
    let tls_cfg = &config.grpc.tls;
    let cert = std::fs::read(&tls_cfg.cert_file)
        .with_context(|| format!("读取证书文件失败: {}", tls_cfg.cert_file))?;
    let key = std::fs::read(&tls_cfg.key_file)
        .with_context(|| format!("读取私钥文件失败: {}", tls_cfg.key_file))?;

    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    // 配置了 CA 时要求客户端证书（双向认证）
    if !tls_cfg.ca_file.is_empty() {
        let ca = std::fs::read(&tls_cfg.ca_file)
            .with_context(|| format!("读取 CA 证书失败: {}", tls_cfg.ca_file))?;
        tls = tls.client_ca_root(Certificate::from_pem(ca));
    }

    Ok(tls)
}

/// 启动 gRPC Server
pub fn start_grpc_server(
    config: Arc<Config>,
    uninstall: Arc<UninstallService>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = match config.grpc_addr().parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("无效的 gRPC 监听地址: {}", e);
                return;
            }
        };

        let service = ControllerServiceServer::new(ControllerServiceImpl { uninstall });
        let mut builder = Server::builder();

        if config.grpc.tls.enabled {
            match load_tls_config(&config) {
                Ok(tls) => match builder.tls_config(tls) {
                    Ok(b) => {
                        info!("gRPC Server 启动 (TLS): {}", addr);
                        builder = b;
                    }
                    Err(e) => {
                        error!("gRPC TLS 配置失败: {}，回退到明文模式", e);
                        warn!("gRPC Server 启动 (明文): {}", addr);
                        builder = Server::builder();
                    }
                },
                Err(e) => {
                    error!("加载 TLS 证书失败: {}，回退到明文模式", e);
                    warn!("gRPC Server 启动 (明文): {}", addr);
                }
            }
        } else {
            info!("gRPC Server 启动 (明文，仅限实验环境): {}", addr);
        }

        if let Err(e) = builder.add_service(service).serve(addr).await {
            error!("gRPC Server 错误: {}", e);
        }
    })
}
