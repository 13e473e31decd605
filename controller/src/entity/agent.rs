use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 代理节点
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub hostname: String,
    pub ip_address: String,
    /// Agent 侧 gRPC 服务端口，推送配置时使用
    pub rpc_port: i32,
    /// IP 段，如 192.168.1.0/24
    pub ip_range: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub version: String,
    /// online | offline | error | uninstalling
    pub status: String,
    /// 注册时颁发的访问令牌，不随管理 API 下发
    #[serde(skip_serializing)]
    pub token: String,
    pub last_heartbeat: Option<DateTime>,
    pub current_connections: i32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_latency: i32,
    pub metadata: Option<Json>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::multiplex_config::Entity")]
    MultiplexConfigs,
}

impl Related<super::multiplex_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MultiplexConfigs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
