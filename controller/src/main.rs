mod api;
mod configs;
mod entity;
mod filters;
mod grpc_server;
mod grpc_service;
mod migration;
mod multiplex;
mod oplog;
mod push;
mod registry;
mod report;
mod repository;
mod uninstall;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sea_orm_migration::MigratorTrait;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::config::{self, Config};

#[derive(Parser)]
#[command(name = "controller", version, about = "Xbox Controller - forwarder 节点群控制器")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "configs/config.yaml")]
    config: String,
}

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub push: Arc<push::AgentPushClient>,
    pub multiplex: Arc<multiplex::MultiplexService>,
    pub uninstall: Arc<uninstall::UninstallService>,
    pub filter_cache: filters::FilterSnapshotCache,
    pub report: Option<Arc<report::ReportService>>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 安装 rustls 加密提供者（TLS 需要）
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let cfg = Arc::new(config::load_config(&cli.config)?);

    init_tracing(&cfg);
    info!("Xbox Controller {} 启动中...", env!("CARGO_PKG_VERSION"));

    // 初始化数据库并运行迁移
    migration::set_database_url(cfg.database_url());
    let db = migration::get_connection().await;
    migration::Migrator::up(db, None).await?;
    info!("✅ 数据库初始化完成");

    // 推送客户端与各服务
    let push_client = Arc::new(push::AgentPushClient::new(&cfg.grpc.tls));
    let multiplex_service = Arc::new(multiplex::MultiplexService::new(push_client.clone()));
    let uninstall_service = Arc::new(uninstall::UninstallService::new(push_client.clone()));
    let filter_cache = filters::FilterSnapshotCache::new(push_client.clone());

    let report_service = if cfg.report.enabled {
        Some(Arc::new(report::ReportService::new(cfg.clone())))
    } else {
        None
    };

    let app_state = AppState {
        push: push_client.clone(),
        multiplex: multiplex_service.clone(),
        uninstall: uninstall_service.clone(),
        filter_cache,
        report: report_service.clone(),
        config: cfg.clone(),
    };

    // 启动 gRPC Server（Agent 注册与心跳入口）
    let _grpc_handle = grpc_server::start_grpc_server(cfg.clone(), uninstall_service.clone());

    // 启动管理 HTTP 服务
    let _web_handle = api::start_web_server(app_state);

    // liveness 扫描
    let _sweep_handle = registry::start_liveness_sweep();

    // 卸载任务 GC
    let _gc_handle = uninstall_service.start_gc();

    // 上游上报
    if let Some(report) = &report_service {
        let _report_handle = report.start();
        info!("节点上报服务已启动，间隔: {}秒", cfg.report.interval);
    }

    info!("✅ 所有服务已启动，等待终止信号...");
    info!("gRPC 地址: {}", cfg.grpc_addr());
    info!("HTTP 地址: {}", cfg.server_addr());

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

    Ok(())
}

/// 初始化 tracing 日志：file 输出走按天轮转，其余走控制台
fn init_tracing(cfg: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx::query=warn", cfg.log.level)));

    if cfg.log.output == "file" {
        let dir = std::path::Path::new(&cfg.log.file)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| "logs".into());
        let file_appender = tracing_appender::rolling::daily(dir, "controller.log");
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
