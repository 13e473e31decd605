//! 操作审计日志
//!
//! 每个管理面变更记一条：操作类型、目标节点、参数摘要、结果。
//! 写失败只记日志，不影响主流程。

use chrono::Utc;
use sea_orm::{ActiveModelTrait, NotSet, Set};
use tracing::warn;

use crate::entity::operation_log;
use crate::migration::get_connection;

/// 记录一次操作结果，error 为 None 表示成功
pub async fn record(
    agent_id: Option<&str>,
    operation_type: &str,
    content: serde_json::Value,
    error: Option<&str>,
) {
    let (result_str, error_message) = match error {
        None => ("success".to_string(), None),
        Some(e) => ("failed".to_string(), Some(e.to_string())),
    };

    let active = operation_log::ActiveModel {
        id: NotSet,
        agent_id: Set(agent_id.map(|s| s.to_string())),
        operation_type: Set(operation_type.to_string()),
        operation_content: Set(Some(content)),
        result: Set(result_str),
        error_message: Set(error_message),
        operator: Set("admin-api".to_string()),
        created_at: Set(Utc::now().naive_utc()),
    };

    let db = get_connection().await;
    if let Err(e) = active.insert(db).await {
        warn!("写入操作日志失败: {}", e);
    }
}
