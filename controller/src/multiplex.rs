//! 多路复用配置服务
//!
//! 校验参数 → 版本化落库（status=inactive）→ 后台推送到 Agent，
//! 推送结果回写 active / error。批量更新逐条独立处理，
//! 聚合 HTTP 状态：全部成功 200，部分成功 206，全部失败 500。

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use common::grpc::xbox;

use crate::entity::{multiplex_config, MultiplexConfig};
use crate::migration::get_connection;
use crate::push::AgentPushClient;
use crate::repository;

/// 支持多路复用的出站协议
pub const MULTIPLEX_PROTOCOLS: [&str; 4] = ["vmess", "vless", "trojan", "shadowsocks"];

/// 单条多路复用更新参数
#[derive(Debug, Clone, Deserialize)]
pub struct MultiplexUpdate {
    pub agent_id: String,
    pub protocol: String,
    pub enabled: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: i32,
    #[serde(default = "default_min_streams")]
    pub min_streams: i32,
    #[serde(default)]
    pub padding: bool,
    #[serde(default)]
    pub brutal: Option<BrutalUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrutalUpdate {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub up: String,
    #[serde(default)]
    pub down: String,
}

fn default_max_connections() -> i32 {
    4
}

fn default_min_streams() -> i32 {
    4
}

/// 批量更新的单条结果
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntryResult {
    pub agent_id: String,
    pub protocol: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
}

/// 校验更新参数（协议枚举与数值范围）
pub fn validate_update(update: &MultiplexUpdate) -> Result<()> {
    if !MULTIPLEX_PROTOCOLS.contains(&update.protocol.as_str()) {
        bail!("不支持的协议类型: {}", update.protocol);
    }
    if !(1..=32).contains(&update.max_connections) {
        bail!("max_connections 必须在 1-32 之间");
    }
    if !(1..=32).contains(&update.min_streams) {
        bail!("min_streams 必须在 1-32 之间");
    }
    Ok(())
}

#[derive(Clone)]
pub struct MultiplexService {
    push: Arc<AgentPushClient>,
}

impl MultiplexService {
    pub fn new(push: Arc<AgentPushClient>) -> Self {
        Self { push }
    }

    /// 更新多路复用配置，返回新配置版本
    ///
    /// 落库后立即返回；Agent 在线时后台推送，结果回写 status 列。
    pub async fn update(&self, update: MultiplexUpdate) -> Result<String> {
        validate_update(&update)?;

        let db = get_connection().await;
        let agent = repository::get_by_id(db, &update.agent_id)
            .await?
            .ok_or_else(|| anyhow!("Agent {} 不存在", update.agent_id))?;

        let config_version = format!("v{}", Utc::now().timestamp());
        let model = self.upsert(db, &update, &config_version).await?;

        // Agent 在线时后台推送，admin 调用不等待
        if agent.status == "online" {
            let service = self.clone();
            let update = update.clone();
            tokio::spawn(async move {
                service.push_and_record(update, model).await;
            });
        }

        Ok(config_version)
    }

    /// 批量更新，逐条独立处理
    pub async fn batch_update(&self, updates: Vec<MultiplexUpdate>) -> Vec<BatchEntryResult> {
        let mut results = Vec::with_capacity(updates.len());
        for update in updates {
            let agent_id = update.agent_id.clone();
            let protocol = update.protocol.clone();
            match self.update(update).await {
                Ok(version) => results.push(BatchEntryResult {
                    agent_id,
                    protocol,
                    success: true,
                    message: "多路复用配置更新成功".to_string(),
                    config_version: Some(version),
                }),
                Err(e) => results.push(BatchEntryResult {
                    agent_id,
                    protocol,
                    success: false,
                    message: e.to_string(),
                    config_version: None,
                }),
            }
        }
        results
    }

    /// 查询落库的多路复用配置；protocol 为空返回该 Agent 全部协议
    pub async fn get(
        &self,
        agent_id: &str,
        protocol: &str,
    ) -> Result<Vec<multiplex_config::Model>> {
        let db = get_connection().await;
        let mut query = MultiplexConfig::find()
            .filter(multiplex_config::Column::AgentId.eq(agent_id));
        if !protocol.is_empty() {
            query = query.filter(multiplex_config::Column::Protocol.eq(protocol));
        }
        Ok(query.all(db).await?)
    }

    async fn upsert(
        &self,
        db: &DatabaseConnection,
        update: &MultiplexUpdate,
        config_version: &str,
    ) -> Result<multiplex_config::Model> {
        let now = Utc::now().naive_utc();
        let brutal_json = update
            .brutal
            .as_ref()
            .filter(|b| b.enabled)
            .map(|b| serde_json::json!(b));

        let existing = MultiplexConfig::find()
            .filter(multiplex_config::Column::AgentId.eq(&update.agent_id))
            .filter(multiplex_config::Column::Protocol.eq(&update.protocol))
            .one(db)
            .await?;

        let model = match existing {
            Some(model) => {
                let mut active: multiplex_config::ActiveModel = model.into();
                active.enabled = Set(update.enabled);
                active.max_connections = Set(update.max_connections);
                active.min_streams = Set(update.min_streams);
                active.padding = Set(update.padding);
                active.brutal_config = Set(brutal_json);
                active.status = Set("inactive".to_string());
                active.error_message = Set(None);
                active.config_version = Set(config_version.to_string());
                active.updated_at = Set(now);
                active.update(db).await?
            }
            None => {
                let active = multiplex_config::ActiveModel {
                    id: NotSet,
                    agent_id: Set(update.agent_id.clone()),
                    protocol: Set(update.protocol.clone()),
                    enabled: Set(update.enabled),
                    multiplex_protocol: Set("smux".to_string()),
                    max_connections: Set(update.max_connections),
                    min_streams: Set(update.min_streams),
                    padding: Set(update.padding),
                    brutal_config: Set(brutal_json),
                    status: Set("inactive".to_string()),
                    error_message: Set(None),
                    config_version: Set(config_version.to_string()),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                active.insert(db).await?
            }
        };

        Ok(model)
    }

    /// 后台推送并把结果回写到配置行
    async fn push_and_record(&self, update: MultiplexUpdate, model: multiplex_config::Model) {
        let request = xbox::MultiplexConfig {
            enabled: update.enabled,
            protocol: "smux".to_string(),
            max_connections: update.max_connections,
            min_streams: update.min_streams,
            padding: update.padding,
            brutal: update.brutal.as_ref().filter(|b| b.enabled).map(|b| xbox::BrutalConfig {
                enabled: true,
                up: b.up.clone(),
                down: b.down.clone(),
            }),
        };

        let result = match self
            .push
            .update_multiplex_config(&update.agent_id, &update.protocol, request)
            .await
        {
            Ok(response) if response.success => Ok(()),
            Ok(response) => Err(anyhow!("{}", response.message)),
            Err(e) => Err(e),
        };

        let db = get_connection().await;
        let mut active: multiplex_config::ActiveModel = model.into();
        match result {
            Ok(()) => {
                info!(
                    "多路复用配置推送成功: agent={}, protocol={}",
                    update.agent_id, update.protocol
                );
                active.status = Set("active".to_string());
                active.error_message = Set(None);
            }
            Err(e) => {
                error!(
                    "多路复用配置推送失败: agent={}, protocol={}: {}",
                    update.agent_id, update.protocol, e
                );
                active.status = Set("error".to_string());
                active.error_message = Set(Some(e.to_string()));
            }
        }
        active.updated_at = Set(Utc::now().naive_utc());
        if let Err(e) = active.update(db).await {
            error!("回写多路复用配置状态失败: {}", e);
        }
    }
}

/// 批量结果的聚合 HTTP 状态：全部成功 200，部分成功 206，全部失败 500
pub fn batch_status_code(results: &[BatchEntryResult]) -> u16 {
    let succeeded = results.iter().filter(|r| r.success).count();
    if succeeded == results.len() && !results.is_empty() {
        200
    } else if succeeded > 0 {
        206
    } else {
        500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(protocol: &str, max_connections: i32, min_streams: i32) -> MultiplexUpdate {
        MultiplexUpdate {
            agent_id: "a1".to_string(),
            protocol: protocol.to_string(),
            enabled: true,
            max_connections,
            min_streams,
            padding: false,
            brutal: None,
        }
    }

    #[test]
    fn test_validate_accepts_range_bounds() {
        assert!(validate_update(&update("vmess", 1, 1)).is_ok());
        assert!(validate_update(&update("shadowsocks", 32, 32)).is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let err = validate_update(&update("vmess", 64, 4)).unwrap_err();
        assert!(err.to_string().contains("max_connections 必须在 1-32 之间"));

        let err = validate_update(&update("vmess", 4, 0)).unwrap_err();
        assert!(err.to_string().contains("min_streams 必须在 1-32 之间"));
    }

    #[test]
    fn test_validate_rejects_unsupported_protocol() {
        let err = validate_update(&update("http", 4, 4)).unwrap_err();
        assert!(err.to_string().contains("不支持的协议类型"));
    }

    #[test]
    fn test_batch_status_code() {
        let entry = |success| BatchEntryResult {
            agent_id: "a1".to_string(),
            protocol: "vmess".to_string(),
            success,
            message: String::new(),
            config_version: None,
        };

        assert_eq!(batch_status_code(&[entry(true), entry(true)]), 200);
        assert_eq!(batch_status_code(&[entry(true), entry(false), entry(true)]), 206);
        assert_eq!(batch_status_code(&[entry(false), entry(false)]), 500);
        assert_eq!(batch_status_code(&[]), 500);
    }
}
