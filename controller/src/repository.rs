//! Agent 数据访问
//!
//! 所有写操作按 agent id 做行级更新。函数显式接收连接，
//! 测试可以直接传入 `sqlite::memory:` 连接。

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

use crate::entity::{agent, Agent};

pub async fn get_by_id(db: &DatabaseConnection, id: &str) -> Result<Option<agent::Model>> {
    Ok(Agent::find_by_id(id).one(db).await?)
}

pub async fn get_by_ip(db: &DatabaseConnection, ip: &str) -> Result<Option<agent::Model>> {
    Ok(Agent::find()
        .filter(agent::Column::IpAddress.eq(ip))
        .one(db)
        .await?)
}

pub async fn list_all(db: &DatabaseConnection) -> Result<Vec<agent::Model>> {
    Ok(Agent::find()
        .order_by_desc(agent::Column::CreatedAt)
        .all(db)
        .await?)
}

pub async fn delete(db: &DatabaseConnection, id: &str) -> Result<()> {
    let result = Agent::delete_by_id(id).exec(db).await?;
    if result.rows_affected == 0 {
        return Err(anyhow!("Agent {} 不存在", id));
    }
    Ok(())
}

/// 更新状态（行级更新）
pub async fn update_status(db: &DatabaseConnection, id: &str, status: &str) -> Result<()> {
    let Some(model) = Agent::find_by_id(id).one(db).await? else {
        return Err(anyhow!("Agent {} 不存在", id));
    };
    let mut active: agent::ActiveModel = model.into();
    active.status = Set(status.to_string());
    active.updated_at = Set(Utc::now().naive_utc());
    active.update(db).await?;
    Ok(())
}

/// 扫描心跳超过 max_offline 的 online 节点（liveness sweep 输入）
pub async fn stale_online_agents(
    db: &DatabaseConnection,
    max_offline: Duration,
) -> Result<Vec<agent::Model>> {
    let cutoff = (Utc::now() - max_offline).naive_utc();
    Ok(Agent::find()
        .filter(agent::Column::Status.eq("online"))
        .filter(
            Condition::any()
                .add(agent::Column::LastHeartbeat.lt(cutoff))
                .add(agent::Column::LastHeartbeat.is_null()),
        )
        .all(db)
        .await?)
}
