//! Agent 卸载编排
//!
//! 按节点 IP 发起卸载：建任务（pending）→ 注册表状态翻到 uninstalling →
//! 下发 Uninstall RPC（sent）→ Agent 以特殊心跳上报结果 → 终态处理
//! （删库或标记 offline）。超时看守在 deadline 后把未完成任务标记 timeout，
//! 终态任务 24 小时后由 5 分钟周期的 GC 清理。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::migration::get_connection;
use crate::push::AgentPushClient;
use crate::repository;

/// 发起方默认超时（秒）
const DEFAULT_TIMEOUT_SECS: i32 = 120;
/// 终态任务保留时长
const TASK_RETENTION_HOURS: i64 = 24;
/// GC 周期
const GC_INTERVAL: Duration = Duration::from_secs(300);

/// 卸载任务，一个 Agent 同一时刻至多一个
#[derive(Debug, Clone, Serialize)]
pub struct UninstallTask {
    pub agent_id: String,
    pub ip: String,
    pub force_uninstall: bool,
    pub reason: String,
    pub timeout_seconds: i32,
    pub delete_from_db: bool,
    /// pending | sent | in_progress | completed | failed | timeout
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cleaned_files: Vec<String>,
    pub cleanup_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UninstallTask {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "timeout")
    }
}

/// 从心跳 metrics 解析出的卸载报告
#[derive(Debug, Clone)]
pub struct UninstallReport {
    pub status: String,
    pub success: Option<bool>,
    pub message: String,
    pub cleanup_time_ms: i64,
    pub cleaned_files_count: i64,
}

impl UninstallReport {
    /// 仅当 metrics 携带卸载字段时返回 Some
    pub fn from_metrics(metrics: &HashMap<String, String>) -> Option<Self> {
        if !metrics.contains_key("uninstall_status") && !metrics.contains_key("uninstall_success") {
            return None;
        }
        Some(Self {
            status: metrics.get("uninstall_status").cloned().unwrap_or_default(),
            success: metrics
                .get("uninstall_success")
                .and_then(|v| v.parse::<bool>().ok()),
            message: metrics.get("uninstall_message").cloned().unwrap_or_default(),
            cleanup_time_ms: metrics
                .get("cleanup_time_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            cleaned_files_count: metrics
                .get("cleaned_files_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// 报告落到任务上之后需要执行的注册表动作
#[derive(Debug, PartialEq, Eq)]
pub enum ReportAction {
    None,
    /// 成功且 delete_from_db：删除注册表记录
    DeleteAgent,
    /// 成功但保留记录：状态置 offline
    MarkOffline,
}

/// 把卸载报告套到任务上（纯状态转移，便于单测）
pub fn apply_report(task: &mut UninstallTask, report: &UninstallReport) -> ReportAction {
    task.updated_at = Utc::now();
    if !report.status.is_empty() {
        task.status = report.status.clone();
    } else {
        task.status = "in_progress".to_string();
    }

    match report.success {
        Some(true) => {
            task.status = "completed".to_string();
            task.cleanup_time_ms = report.cleanup_time_ms;
            if task.delete_from_db {
                ReportAction::DeleteAgent
            } else {
                ReportAction::MarkOffline
            }
        }
        Some(false) => {
            task.status = "failed".to_string();
            if !report.message.is_empty() {
                task.error = Some(report.message.clone());
            }
            ReportAction::None
        }
        None => ReportAction::None,
    }
}

#[derive(Clone)]
pub struct UninstallService {
    tasks: Arc<tokio::sync::RwLock<HashMap<String, UninstallTask>>>,
    push: Arc<AgentPushClient>,
}

impl UninstallService {
    pub fn new(push: Arc<AgentPushClient>) -> Self {
        Self {
            tasks: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            push,
        }
    }

    /// 按节点 IP 发起卸载
    pub async fn initiate(
        &self,
        ip: &str,
        force_uninstall: bool,
        reason: &str,
        timeout_seconds: i32,
        delete_from_db: bool,
    ) -> Result<UninstallTask> {
        let db = get_connection().await;
        let agent = repository::get_by_ip(db, ip)
            .await?
            .ok_or_else(|| anyhow!("未找到 IP 地址为 {} 的 Agent", ip))?;

        if agent.status != "online" && !force_uninstall {
            bail!("Agent 不在线，当前状态: {}", agent.status);
        }

        {
            let tasks = self.tasks.read().await;
            if let Some(existing) = tasks.get(&agent.id) {
                if !existing.is_terminal() {
                    bail!("Agent {} 已有进行中的卸载任务", agent.id);
                }
            }
        }

        let timeout_seconds = if timeout_seconds > 0 {
            timeout_seconds
        } else {
            DEFAULT_TIMEOUT_SECS
        };

        let now = Utc::now();
        let task = UninstallTask {
            agent_id: agent.id.clone(),
            ip: agent.ip_address.clone(),
            force_uninstall,
            reason: reason.to_string(),
            timeout_seconds,
            delete_from_db,
            status: "pending".to_string(),
            created_at: now,
            updated_at: now,
            cleaned_files: Vec::new(),
            cleanup_time_ms: 0,
            error: None,
        };

        self.tasks
            .write()
            .await
            .insert(agent.id.clone(), task.clone());

        info!(
            "创建卸载任务: agent={}, ip={}, force={}, timeout={}s, delete_from_db={}",
            task.agent_id, task.ip, force_uninstall, timeout_seconds, delete_from_db
        );

        // 注册表状态翻到 uninstalling，liveness 扫描不再触碰
        if let Err(e) = repository::update_status(db, &agent.id, "uninstalling").await {
            warn!("更新 Agent 状态失败: {}", e);
        }

        // 超时看守
        let service = self.clone();
        let watcher_agent_id = agent.id.clone();
        tokio::spawn(async move {
            service
                .watch_timeout(watcher_agent_id, timeout_seconds, force_uninstall, delete_from_db)
                .await;
        });

        // 下发卸载指令
        let service = self.clone();
        let dispatch_agent_id = agent.id.clone();
        let dispatch_reason = reason.to_string();
        tokio::spawn(async move {
            service
                .dispatch(dispatch_agent_id, force_uninstall, dispatch_reason, timeout_seconds)
                .await;
        });

        Ok(task)
    }

    async fn dispatch(&self, agent_id: String, force: bool, reason: String, timeout_seconds: i32) {
        self.set_task_status(&agent_id, "sent").await;

        match self
            .push
            .uninstall(&agent_id, force, &reason, timeout_seconds)
            .await
        {
            Ok(response) => {
                info!(
                    "Agent {} 卸载指令已执行: success={}, status={}",
                    agent_id, response.success, response.uninstall_status
                );
                // 结果正文以心跳报告为准，这里只记录 RPC 层面的清理文件列表
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&agent_id) {
                    if !response.cleaned_files.is_empty() {
                        task.cleaned_files = response.cleaned_files;
                    }
                }
            }
            Err(e) => {
                error!("下发卸载指令到 Agent {} 失败: {}", agent_id, e);
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&agent_id) {
                    if !task.is_terminal() {
                        task.error = Some(format!("push failed: {}", e));
                        task.updated_at = Utc::now();
                    }
                }
            }
        }
    }

    async fn set_task_status(&self, agent_id: &str, status: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(agent_id) {
            if !task.is_terminal() {
                task.status = status.to_string();
                task.updated_at = Utc::now();
            }
        }
    }

    /// 处理 Agent 以心跳形式上报的卸载结果
    pub async fn process_report(
        &self,
        agent_id: &str,
        metrics: &HashMap<String, String>,
    ) -> Result<()> {
        let report = UninstallReport::from_metrics(metrics)
            .ok_or_else(|| anyhow!("心跳未携带卸载报告字段"))?;

        let action = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(agent_id)
                .ok_or_else(|| anyhow!("未找到 Agent {} 的卸载任务", agent_id))?;
            info!(
                "收到 Agent {} 卸载状态上报: status={}, success={:?}, files={}",
                agent_id, report.status, report.success, report.cleaned_files_count
            );
            apply_report(task, &report)
        };

        let db = get_connection().await;
        match action {
            ReportAction::DeleteAgent => {
                if let Err(e) = repository::delete(db, agent_id).await {
                    error!("从数据库删除 Agent {} 失败: {}", agent_id, e);
                    let mut tasks = self.tasks.write().await;
                    if let Some(task) = tasks.get_mut(agent_id) {
                        task.error = Some(format!("删除 Agent 失败: {}", e));
                    }
                } else {
                    info!("Agent {} 已从数据库删除", agent_id);
                }
            }
            ReportAction::MarkOffline => {
                if let Err(e) = repository::update_status(db, agent_id, "offline").await {
                    error!("更新 Agent {} 状态为 offline 失败: {}", agent_id, e);
                }
            }
            ReportAction::None => {}
        }

        Ok(())
    }

    pub async fn get_task(&self, agent_id: &str) -> Option<UninstallTask> {
        self.tasks.read().await.get(agent_id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<UninstallTask> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// 超时看守：deadline 内未到终态则标记 timeout；
    /// force + delete_from_db 时即便超时也删除注册表记录。
    async fn watch_timeout(
        &self,
        agent_id: String,
        timeout_seconds: i32,
        force: bool,
        delete_from_db: bool,
    ) {
        tokio::time::sleep(Duration::from_secs(timeout_seconds.max(0) as u64)).await;

        let timed_out = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&agent_id) {
                Some(task) if !task.is_terminal() => {
                    task.status = "timeout".to_string();
                    task.error = Some(format!("卸载操作超时（{}s）", timeout_seconds));
                    task.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };

        if !timed_out {
            return;
        }

        warn!("Agent {} 卸载超时", agent_id);

        if force && delete_from_db {
            let db = get_connection().await;
            match repository::delete(db, &agent_id).await {
                Ok(()) => info!("强制删除超时 Agent 成功: {}", agent_id),
                Err(e) => error!("强制删除超时 Agent 失败: {}", e),
            }
        }
    }

    /// 清理滞留超过保留期的终态任务
    pub async fn cleanup_expired_tasks(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(TASK_RETENTION_HOURS);
        let mut tasks = self.tasks.write().await;
        tasks.retain(|agent_id, task| {
            let expired = task.is_terminal() && task.updated_at < cutoff;
            if expired {
                info!("清理过期卸载任务: agent={}, status={}", agent_id, task.status);
            }
            !expired
        });
    }

    /// 启动周期 GC 任务
    pub fn start_gc(&self) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                service.cleanup_expired_tasks().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(delete_from_db: bool) -> UninstallTask {
        let now = Utc::now();
        UninstallTask {
            agent_id: "a1".to_string(),
            ip: "10.0.0.1".to_string(),
            force_uninstall: false,
            reason: "test".to_string(),
            timeout_seconds: 60,
            delete_from_db,
            status: "sent".to_string(),
            created_at: now,
            updated_at: now,
            cleaned_files: Vec::new(),
            cleanup_time_ms: 0,
            error: None,
        }
    }

    fn metrics(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_report_ignores_plain_heartbeat() {
        let plain = metrics(&[("cpu_usage", "1.5")]);
        assert!(UninstallReport::from_metrics(&plain).is_none());
    }

    #[test]
    fn test_success_with_delete_from_db() {
        let mut task = task(true);
        let report = UninstallReport::from_metrics(&metrics(&[
            ("uninstall_status", "completed"),
            ("uninstall_success", "true"),
            ("cleanup_time_ms", "1234"),
            ("cleaned_files_count", "5"),
        ]))
        .unwrap();

        let action = apply_report(&mut task, &report);
        assert_eq!(action, ReportAction::DeleteAgent);
        assert_eq!(task.status, "completed");
        assert_eq!(task.cleanup_time_ms, 1234);
    }

    #[test]
    fn test_success_without_delete_marks_offline() {
        let mut task = task(false);
        let report = UninstallReport::from_metrics(&metrics(&[
            ("uninstall_status", "completed"),
            ("uninstall_success", "true"),
        ]))
        .unwrap();

        let action = apply_report(&mut task, &report);
        assert_eq!(action, ReportAction::MarkOffline);
        assert_eq!(task.status, "completed");
    }

    #[test]
    fn test_failure_records_error() {
        let mut task = task(true);
        let report = UninstallReport::from_metrics(&metrics(&[
            ("uninstall_status", "cleaning_files"),
            ("uninstall_success", "false"),
            ("uninstall_message", "停止 forwarder 服务失败"),
        ]))
        .unwrap();

        let action = apply_report(&mut task, &report);
        assert_eq!(action, ReportAction::None);
        assert_eq!(task.status, "failed");
        assert_eq!(task.error.as_deref(), Some("停止 forwarder 服务失败"));
    }

    #[test]
    fn test_progress_report_keeps_task_open() {
        let mut task = task(false);
        let report = UninstallReport::from_metrics(&metrics(&[(
            "uninstall_status",
            "stopping_service",
        )]))
        .unwrap();

        let action = apply_report(&mut task, &report);
        assert_eq!(action, ReportAction::None);
        assert_eq!(task.status, "stopping_service");
        assert!(!task.is_terminal());
    }
}
