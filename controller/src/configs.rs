//! 配置下发记录
//!
//! UpdateConfig 推送前先落库（pending），推送结果回写 applied / failed，
//! 保留每个 Agent 的配置下发历史供追溯。

use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, NotSet, Set};

use crate::entity::config_record;

/// 推送前记录意图，返回记录行
pub async fn record_intent(
    db: &DatabaseConnection,
    agent_id: &str,
    config_content: &str,
    config_version: &str,
) -> Result<config_record::Model> {
    let active = config_record::ActiveModel {
        id: NotSet,
        agent_id: Set(agent_id.to_string()),
        config_content: Set(config_content.to_string()),
        config_version: Set(config_version.to_string()),
        status: Set("pending".to_string()),
        apply_time: Set(None),
        error_message: Set(None),
        created_at: Set(Utc::now().naive_utc()),
    };
    active.insert(db).await.context("记录配置下发意图失败")
}

/// 推送成功：状态 applied，记录生效时间
pub async fn mark_applied(
    db: &DatabaseConnection,
    record: config_record::Model,
) -> Result<()> {
    let mut active: config_record::ActiveModel = record.into();
    active.status = Set("applied".to_string());
    active.apply_time = Set(Some(Utc::now().naive_utc()));
    active.update(db).await.context("更新配置下发记录失败")?;
    Ok(())
}

/// 推送失败：状态 failed，保留错误信息
pub async fn mark_failed(
    db: &DatabaseConnection,
    record: config_record::Model,
    error: &str,
) -> Result<()> {
    let mut active: config_record::ActiveModel = record.into();
    active.status = Set("failed".to_string());
    active.error_message = Set(Some(error.to_string()));
    active.update(db).await.context("更新配置下发记录失败")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{Database, EntityTrait};
    use sea_orm_migration::MigratorTrait;

    use crate::entity::ConfigRecord;
    use crate::migration::Migrator;

    #[tokio::test]
    async fn test_intent_lifecycle() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let record = record_intent(&db, "a1", "{}", "v100").await.unwrap();
        assert_eq!(record.status, "pending");
        assert!(record.apply_time.is_none());

        mark_applied(&db, record).await.unwrap();
        let stored = ConfigRecord::find().one(&db).await.unwrap().unwrap();
        assert_eq!(stored.status, "applied");
        assert!(stored.apply_time.is_some());

        let record = record_intent(&db, "a1", "{}", "v101").await.unwrap();
        mark_failed(&db, record, "validation_failed").await.unwrap();
        let failed = ConfigRecord::find_by_id(2).one(&db).await.unwrap().unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error_message.as_deref(), Some("validation_failed"));
    }
}
