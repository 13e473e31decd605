use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 配置下发记录：推送前落库 pending，推送结果回写 applied / failed
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub agent_id: String,
    #[sea_orm(column_type = "Text")]
    pub config_content: String,
    pub config_version: String,
    /// pending | applied | failed
    pub status: String,
    pub apply_time: Option<DateTime>,
    pub error_message: Option<String>,
    pub created_at: DateTime,
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
