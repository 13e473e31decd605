//! 应用配置定义
//!
//! Controller 与 Agent 共用的分层配置：YAML 文件 → `XBOX_` 前缀环境变量 → 内置默认值。
//! 环境变量键按 `.` → `_` 替换，例如 `XBOX_GRPC_PORT` 覆盖 `grpc.port`。

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// HTTP 管理服务配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// debug | release | test
    #[serde(default = "default_server_mode")]
    pub mode: String,
}

/// 数据库配置（SQLite）
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    #[serde(default = "default_db_database")]
    pub database: String,
}

/// gRPC 服务配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GrpcConfig {
    #[serde(default = "default_grpc_host")]
    pub host: String,
    #[serde(default = "default_grpc_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
}

/// TLS 配置（禁用时走明文，仅限实验环境）
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub server_name: String,
}

/// 日志配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// json | text
    #[serde(default = "default_log_format")]
    pub format: String,
    /// stdout | file
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_max_size")]
    pub max_size: u32,
    #[serde(default = "default_log_max_backups")]
    pub max_backups: u32,
    #[serde(default = "default_log_max_age")]
    pub max_age: u32,
}

/// Agent 配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentConfig {
    /// 为空时使用 hostname-unix秒 自动生成
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_controller_addr")]
    pub controller_addr: String,
    /// Agent 侧 gRPC 服务监听端口（Controller 回推配置使用）
    #[serde(default = "default_agent_listen_port")]
    pub listen_port: u16,
    /// 心跳间隔（秒）
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_forwarder_binary")]
    pub forwarder_binary: String,
    #[serde(default = "default_forwarder_config")]
    pub forwarder_config: String,
    /// 过滤器配置持久化路径
    #[serde(default = "default_filter_config")]
    pub filter_config: String,
}

/// 节点上报配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReportConfig {
    #[serde(default = "default_report_enabled")]
    pub enabled: bool,
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// 上报间隔（秒）
    #[serde(default = "default_report_interval")]
    pub interval: u64,
    /// 请求超时（秒）
    #[serde(default = "default_report_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// 重试延迟（秒）
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// 上报给后端的 Controller 标识
    #[serde(default = "default_controller_id")]
    pub controller_id: String,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_server_mode() -> String {
    "release".to_string()
}

fn default_db_database() -> String {
    "data/xbox.db".to_string()
}

fn default_grpc_host() -> String {
    "0.0.0.0".to_string()
}

fn default_grpc_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_log_file() -> String {
    "logs/app.log".to_string()
}

fn default_log_max_size() -> u32 {
    100
}

fn default_log_max_backups() -> u32 {
    10
}

fn default_log_max_age() -> u32 {
    30
}

fn default_controller_addr() -> String {
    "http://localhost:9090".to_string()
}

fn default_agent_listen_port() -> u16 {
    9091
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_forwarder_binary() -> String {
    "sing-box".to_string()
}

fn default_forwarder_config() -> String {
    "./sing-box.json".to_string()
}

fn default_filter_config() -> String {
    "./configs/filter.json".to_string()
}

fn default_report_enabled() -> bool {
    false
}

fn default_backend_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_report_interval() -> u64 {
    60
}

fn default_report_timeout() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_controller_id() -> String {
    "xbox-controller-001".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            mode: default_server_mode(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database: default_db_database(),
        }
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            host: default_grpc_host(),
            port: default_grpc_port(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file: default_log_file(),
            max_size: default_log_max_size(),
            max_backups: default_log_max_backups(),
            max_age: default_log_max_age(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            controller_addr: default_controller_addr(),
            listen_port: default_agent_listen_port(),
            heartbeat_interval: default_heartbeat_interval(),
            forwarder_binary: default_forwarder_binary(),
            forwarder_config: default_forwarder_config(),
            filter_config: default_filter_config(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: default_report_enabled(),
            backend_url: default_backend_url(),
            interval: default_report_interval(),
            timeout: default_report_timeout(),
            retry_count: default_retry_count(),
            retry_delay: default_retry_delay(),
            controller_id: default_controller_id(),
        }
    }
}

impl Config {
    /// 获取数据库连接 URL
    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database.database)
    }

    /// 获取 HTTP 服务监听地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 获取 gRPC 服务监听地址
    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.grpc.host, self.grpc.port)
    }
}

/// 加载配置文件并应用环境变量覆盖
///
/// 配置文件不存在时不报错，直接落回默认值（与环境变量覆盖配合用于容器部署）。
pub fn load_config(path: &str) -> Result<Config> {
    let mut config: Config = if Path::new(path).exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path))?
    } else {
        tracing::warn!("配置文件 {} 不存在，使用默认配置", path);
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// 应用 `XBOX_` 前缀的环境变量覆盖
fn apply_env_overrides(config: &mut Config) {
    override_string("XBOX_SERVER_HOST", &mut config.server.host);
    override_parse("XBOX_SERVER_PORT", &mut config.server.port);
    override_string("XBOX_SERVER_MODE", &mut config.server.mode);

    override_string("XBOX_DATABASE_DATABASE", &mut config.database.database);

    override_string("XBOX_GRPC_HOST", &mut config.grpc.host);
    override_parse("XBOX_GRPC_PORT", &mut config.grpc.port);
    override_parse("XBOX_GRPC_TLS_ENABLED", &mut config.grpc.tls.enabled);
    override_string("XBOX_GRPC_TLS_CERT_FILE", &mut config.grpc.tls.cert_file);
    override_string("XBOX_GRPC_TLS_KEY_FILE", &mut config.grpc.tls.key_file);
    override_string("XBOX_GRPC_TLS_CA_FILE", &mut config.grpc.tls.ca_file);
    override_string("XBOX_GRPC_TLS_SERVER_NAME", &mut config.grpc.tls.server_name);

    override_string("XBOX_LOG_LEVEL", &mut config.log.level);
    override_string("XBOX_LOG_FORMAT", &mut config.log.format);
    override_string("XBOX_LOG_OUTPUT", &mut config.log.output);
    override_string("XBOX_LOG_FILE", &mut config.log.file);
    override_parse("XBOX_LOG_MAX_SIZE", &mut config.log.max_size);
    override_parse("XBOX_LOG_MAX_BACKUPS", &mut config.log.max_backups);
    override_parse("XBOX_LOG_MAX_AGE", &mut config.log.max_age);

    override_string("XBOX_AGENT_ID", &mut config.agent.id);
    override_string("XBOX_AGENT_CONTROLLER_ADDR", &mut config.agent.controller_addr);
    override_parse("XBOX_AGENT_LISTEN_PORT", &mut config.agent.listen_port);
    override_parse("XBOX_AGENT_HEARTBEAT_INTERVAL", &mut config.agent.heartbeat_interval);
    override_string("XBOX_AGENT_FORWARDER_BINARY", &mut config.agent.forwarder_binary);
    override_string("XBOX_AGENT_FORWARDER_CONFIG", &mut config.agent.forwarder_config);
    override_string("XBOX_AGENT_FILTER_CONFIG", &mut config.agent.filter_config);

    override_parse("XBOX_REPORT_ENABLED", &mut config.report.enabled);
    override_string("XBOX_REPORT_BACKEND_URL", &mut config.report.backend_url);
    override_parse("XBOX_REPORT_INTERVAL", &mut config.report.interval);
    override_parse("XBOX_REPORT_TIMEOUT", &mut config.report.timeout);
    override_parse("XBOX_REPORT_RETRY_COUNT", &mut config.report.retry_count);
    override_parse("XBOX_REPORT_RETRY_DELAY", &mut config.report.retry_delay);
    override_string("XBOX_REPORT_CONTROLLER_ID", &mut config.report.controller_id);
}

fn override_string(key: &str, target: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn override_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<T>() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.grpc.port, 9090);
        assert_eq!(config.agent.heartbeat_interval, 30);
        assert_eq!(config.agent.listen_port, 9091);
        assert_eq!(config.database.database, "data/xbox.db");
        assert!(!config.grpc.tls.enabled);
        assert_eq!(config.report.retry_count, 3);
    }

    #[test]
    fn test_yaml_partial_overrides_defaults() {
        let yaml = r#"
server:
  port: 9000
agent:
  id: "agent-a"
  heartbeat_interval: 10
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        // 未出现的键保持默认值
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.agent.id, "agent-a");
        assert_eq!(config.agent.heartbeat_interval, 10);
        assert_eq!(config.grpc.port, 9090);
    }

    #[test]
    fn test_env_override() {
        let mut config = Config::default();
        env::set_var("XBOX_GRPC_PORT", "19090");
        env::set_var("XBOX_AGENT_ID", "env-agent");
        apply_env_overrides(&mut config);
        env::remove_var("XBOX_GRPC_PORT");
        env::remove_var("XBOX_AGENT_ID");

        assert_eq!(config.grpc.port, 19090);
        assert_eq!(config.agent.id, "env-agent");
    }

    #[test]
    fn test_database_url() {
        let mut config = Config::default();
        assert_eq!(config.database_url(), "sqlite://data/xbox.db?mode=rwc");

        config.database.database = "custom/fleet.db".to_string();
        assert_eq!(config.database_url(), "sqlite://custom/fleet.db?mode=rwc");
    }
}
