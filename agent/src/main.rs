mod client;
mod filter;
mod forwarder;
mod monitor;
mod multiplex;
mod network;
mod server;
mod supervisor;
mod uninstall;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::config;

#[derive(Parser)]
#[command(name = "agent", version, about = "Xbox Agent - forwarder 节点守护进程")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "configs/config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 安装 rustls 加密提供者（只调用一次）
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let cfg = Arc::new(config::load_config(&cli.config)?);

    init_tracing(&cfg);
    info!("Xbox Agent {} 启动中...", env!("CARGO_PKG_VERSION"));

    let agent_client = Arc::new(client::AgentClient::new(cfg.clone()));
    info!("Agent ID: {}", agent_client.agent_id());
    info!("Controller 地址: {}", cfg.agent.controller_addr);

    // 启动 gRPC 服务（接收 Controller 的配置推送）
    let _server_handle = server::start_rpc_server(cfg.clone(), agent_client.clone());

    // 连接并注册，失败即启动失败
    agent_client.connect().await?;
    agent_client.register().await?;

    // 心跳循环
    tokio::spawn(agent_client.clone().run_heartbeat_loop());

    // forwarder 二进制与配置就绪时自动启动
    agent_client.maybe_start_forwarder().await;

    info!("Agent 服务已启动，等待终止信号...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C 信号，正在关闭服务...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("收到 SIGTERM 信号，正在关闭服务...");
        }
    }

    agent_client.shutdown().await;
    Ok(())
}

/// 初始化 tracing 日志：file 输出走按天轮转，其余走控制台
fn init_tracing(cfg: &common::config::Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log.level.clone()));

    if cfg.log.output == "file" {
        let dir = std::path::Path::new(&cfg.log.file)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| "logs".into());
        let file_appender = tracing_appender::rolling::daily(dir, "agent.log");
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(file_appender).with_ansi(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}
