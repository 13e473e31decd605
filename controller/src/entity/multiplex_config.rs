use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 多路复用配置，(agent_id, protocol) 唯一
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "multiplex_configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub agent_id: String,
    pub protocol: String,
    pub enabled: bool,
    /// 内层协议，固定为 smux
    pub multiplex_protocol: String,
    pub max_connections: i32,
    pub min_streams: i32,
    pub padding: bool,
    /// brutal 子配置（可选）
    pub brutal_config: Option<Json>,
    /// active | inactive | error
    pub status: String,
    pub error_message: Option<String>,
    pub config_version: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::agent::Entity",
        from = "Column::AgentId",
        to = "super::agent::Column::Id"
    )]
    Agent,
}

impl Related<super::agent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Agent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
