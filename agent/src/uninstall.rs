//! 本机卸载流水线
//!
//! 停止 forwarder（systemd → PID 文件 → 进程名三级降级）、清理文件、
//! 移除 systemd 单元，强制模式下连二进制一并删除。整个流水线受超时约束。

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{info, warn};

/// Agent 侧默认超时（秒）
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// 候选 systemd 服务名
const SERVICE_NAMES: [&str; 3] = ["sing-box", "xbox-singbox", "singbox"];

/// 候选 PID 文件路径
const PID_FILES: [&str; 3] = ["./sing-box.pid", "/var/run/sing-box.pid", "/tmp/sing-box.pid"];

/// 候选 systemd 单元文件
const SERVICE_FILES: [&str; 4] = [
    "/etc/systemd/system/sing-box.service",
    "/lib/systemd/system/sing-box.service",
    "/etc/systemd/system/xbox-singbox.service",
    "/lib/systemd/system/xbox-singbox.service",
];

#[derive(Debug, Clone)]
pub struct UninstallResult {
    pub success: bool,
    pub message: String,
    pub status: String,
    pub cleaned_files: Vec<String>,
    pub cleanup_time_ms: i64,
}

pub struct UninstallManager {
    binary_path: String,
    cleanup_paths: Vec<PathBuf>,
}

impl UninstallManager {
    pub fn new(binary_path: &str, config_path: &str, filter_path: &str) -> Self {
        let mut cleanup_paths: Vec<PathBuf> = [
            // forwarder 配置
            config_path,
            "./sing-box.json",
            "./configs/sing-box.json",
            "/etc/sing-box/config.json",
            "/usr/local/etc/sing-box/config.json",
            // 过滤器配置
            filter_path,
            "./configs/filter.json",
            "./filter.json",
            // 日志
            "./logs/sing-box.log",
            "./logs/agent.log",
            "/var/log/sing-box.log",
            // systemd 单元
            "/etc/systemd/system/sing-box.service",
            "/lib/systemd/system/sing-box.service",
            // PID 文件
            "./sing-box.pid",
            "/var/run/sing-box.pid",
            "/tmp/sing-box.pid",
            // 缓存目录
            "./cache/",
            "/tmp/sing-box/",
            "/var/cache/sing-box/",
            // 配置备份
            "./configs/sing-box.json.backup",
            "./sing-box.json.backup",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        cleanup_paths.dedup();

        Self {
            binary_path: binary_path.to_string(),
            cleanup_paths,
        }
    }

    /// 执行卸载流水线，整体受 timeout_seconds 约束（0 使用默认 60 秒）
    pub async fn run(&self, force: bool, timeout_seconds: i32) -> UninstallResult {
        let start = Instant::now();
        let timeout = if timeout_seconds > 0 {
            Duration::from_secs(timeout_seconds as u64)
        } else {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        };

        info!(
            "开始卸载 forwarder: force={}, timeout={}s",
            force,
            timeout.as_secs()
        );

        let mut result = match tokio::time::timeout(timeout, self.pipeline(force)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("卸载操作超时（{}s）", timeout.as_secs());
                UninstallResult {
                    success: false,
                    message: format!("卸载操作超时（{}s）", timeout.as_secs()),
                    status: "timeout".to_string(),
                    cleaned_files: Vec::new(),
                    cleanup_time_ms: 0,
                }
            }
        };

        result.cleanup_time_ms = start.elapsed().as_millis() as i64;
        result
    }

    async fn pipeline(&self, force: bool) -> UninstallResult {
        let mut result = UninstallResult {
            success: false,
            message: String::new(),
            status: "preparing".to_string(),
            cleaned_files: Vec::new(),
            cleanup_time_ms: 0,
        };

        // 1. 停止 forwarder 服务
        result.status = "stopping_service".to_string();
        if let Err(e) = self.stop_forwarder(force).await {
            if !force {
                result.message = format!("停止 forwarder 服务失败: {}", e);
                return result;
            }
            warn!("停止 forwarder 服务失败，强制模式继续: {}", e);
        }

        // 2. 清理相关文件
        result.status = "cleaning_files".to_string();
        result.cleaned_files = self.cleanup_files(force);
        info!("已清理 {} 个文件", result.cleaned_files.len());

        // 3. 移除 systemd 单元
        result.status = "cleaning_service".to_string();
        self.remove_systemd_units().await;

        // 4. 强制模式下删除二进制
        result.status = "cleaning_binary".to_string();
        if let Err(e) = self.cleanup_binary(force) {
            if !force {
                result.message = format!("清理二进制文件失败: {}", e);
                return result;
            }
            warn!("清理二进制文件失败，强制模式继续: {}", e);
        }

        result.status = "completed".to_string();
        result.success = true;
        result.message = "forwarder 卸载完成".to_string();
        result
    }

    /// 三级降级停止：systemctl → PID 文件 → pgrep
    async fn stop_forwarder(&self, force: bool) -> anyhow::Result<()> {
        if self.stop_by_systemd().await {
            info!("通过 systemctl 停止 forwarder 成功");
            return Ok(());
        }

        if self.stop_by_pid_file().await {
            info!("通过 PID 文件停止 forwarder 成功");
            return Ok(());
        }

        self.stop_by_process_name(force).await
    }

    async fn stop_by_systemd(&self) -> bool {
        for service in SERVICE_NAMES {
            let stopped = Command::new("systemctl")
                .args(["stop", service])
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !stopped {
                continue;
            }

            tokio::time::sleep(Duration::from_secs(2)).await;

            // 确认服务已退出
            if let Ok(output) = Command::new("systemctl")
                .args(["is-active", service])
                .output()
                .await
            {
                if String::from_utf8_lossy(&output.stdout).trim() == "inactive" {
                    info!("systemd 服务 {} 已停止", service);
                    return true;
                }
            }
        }
        false
    }

    async fn stop_by_pid_file(&self) -> bool {
        for pid_file in PID_FILES {
            let Ok(content) = std::fs::read_to_string(pid_file) else {
                continue;
            };
            let pid = content.trim();
            if pid.is_empty() {
                continue;
            }

            let sent = Command::new("kill")
                .args(["-TERM", pid])
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !sent {
                continue;
            }

            tokio::time::sleep(Duration::from_secs(3)).await;

            // kill -0 验证进程是否还在
            let alive = Command::new("kill")
                .args(["-0", pid])
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if alive {
                let _ = Command::new("kill").args(["-KILL", pid]).output().await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            std::fs::remove_file(pid_file).ok();
            return true;
        }
        false
    }

    async fn stop_by_process_name(&self, force: bool) -> anyhow::Result<()> {
        let output = Command::new("pgrep").args(["-f", "sing-box"]).output().await?;
        if !output.status.success() {
            // 没有存活进程就视为已停止
            return Ok(());
        }

        let pids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        for pid in &pids {
            info!("正在停止 forwarder 进程: {}", pid);
            let _ = Command::new("kill").args(["-TERM", pid]).output().await;
        }

        tokio::time::sleep(Duration::from_secs(5)).await;

        // 清点幸存进程
        if let Ok(check) = Command::new("pgrep").args(["-f", "sing-box"]).output().await {
            if check.status.success() {
                let survivors: Vec<String> = String::from_utf8_lossy(&check.stdout)
                    .split_whitespace()
                    .map(|s| s.to_string())
                    .collect();
                if !survivors.is_empty() {
                    if !force {
                        anyhow::bail!("仍有 {} 个 forwarder 进程存活", survivors.len());
                    }
                    for pid in &survivors {
                        warn!("强制终止 forwarder 进程: {}", pid);
                        let _ = Command::new("kill").args(["-KILL", pid]).output().await;
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }

        Ok(())
    }

    fn cleanup_files(&self, force: bool) -> Vec<String> {
        let mut cleaned = Vec::new();
        for path in &self.cleanup_paths {
            if cleanup_path(path, force) {
                info!("已清理: {}", path.display());
                cleaned.push(path.display().to_string());
            }
        }
        cleaned
    }

    async fn remove_systemd_units(&self) {
        let mut removed = false;
        for unit in SERVICE_FILES {
            let path = Path::new(unit);
            if !path.exists() {
                continue;
            }

            let unit_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let _ = Command::new("systemctl")
                .args(["disable", &unit_name])
                .output()
                .await;

            match std::fs::remove_file(path) {
                Ok(()) => {
                    info!("已移除 systemd 单元文件: {}", unit);
                    removed = true;
                }
                Err(e) => warn!("无法删除单元文件 {}: {}", unit, e),
            }
        }

        if removed {
            let _ = Command::new("systemctl").arg("daemon-reload").output().await;
            info!("已重新加载 systemd 配置");
        }
    }

    fn cleanup_binary(&self, force: bool) -> anyhow::Result<()> {
        if self.binary_path.is_empty() {
            return Ok(());
        }
        let path = Path::new(&self.binary_path);
        if !path.exists() {
            return Ok(());
        }

        // 只在强制模式下删除二进制
        if force {
            std::fs::remove_file(path)
                .map_err(|e| anyhow::anyhow!("删除二进制文件失败: {}", e))?;
            info!("已删除 forwarder 二进制: {}", self.binary_path);
        } else {
            info!("非强制模式，保留 forwarder 二进制");
        }
        Ok(())
    }
}

/// 清理单个路径，强制模式下修改权限后重试
fn cleanup_path(path: &Path, force: bool) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };

    let removed = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match removed {
        Ok(()) => true,
        Err(_) if force => {
            chmod_recursive(path);
            let retried = if meta.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            if let Err(e) = &retried {
                warn!("无法删除 {}: {}", path.display(), e);
            }
            retried.is_ok()
        }
        Err(_) => false,
    }
}

#[cfg(unix)]
fn chmod_recursive(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = if meta.is_dir() { 0o777 } else { 0o666 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).ok();
        if meta.is_dir() {
            if let Ok(entries) = std::fs::read_dir(path) {
                for entry in entries.flatten() {
                    chmod_recursive(&entry.path());
                }
            }
        }
    }
}

#[cfg(not(unix))]
fn chmod_recursive(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_removes_listed_files() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("sing-box.json");
        let filter = dir.path().join("filter.json");
        std::fs::write(&config, "{}").unwrap();
        std::fs::write(&filter, "{}").unwrap();

        let manager = UninstallManager::new(
            "",
            config.to_str().unwrap(),
            filter.to_str().unwrap(),
        );
        let cleaned = manager.cleanup_files(false);

        assert!(cleaned.contains(&config.display().to_string()));
        assert!(cleaned.contains(&filter.display().to_string()));
        assert!(!config.exists());
        assert!(!filter.exists());
    }

    #[tokio::test]
    async fn test_binary_kept_without_force() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("sing-box");
        std::fs::write(&binary, "#!/bin/sh").unwrap();

        let manager = UninstallManager::new(binary.to_str().unwrap(), "", "");
        manager.cleanup_binary(false).unwrap();
        assert!(binary.exists());

        manager.cleanup_binary(true).unwrap();
        assert!(!binary.exists());
    }

    #[tokio::test]
    async fn test_pipeline_timeout() {
        // 超短超时下流水线内部的 sleep 必然触发超时分支
        let manager = UninstallManager::new("", "", "");
        let result = manager.run(false, 1).await;
        // systemctl/pgrep 在多数环境会很快失败，结果要么按时完成要么超时，
        // 两种情况都必须带上耗时与状态
        assert!(!result.status.is_empty());
        assert!(result.cleanup_time_ms >= 0);
    }
}
