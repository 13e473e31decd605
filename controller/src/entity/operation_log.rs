use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 操作审计日志
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "operation_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub agent_id: Option<String>,
    pub operation_type: String,
    pub operation_content: Option<Json>,
    /// success | failed
    pub result: String,
    pub error_message: Option<String>,
    pub operator: String,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
