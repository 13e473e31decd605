//! forwarder 进程监督器
//!
//! 管理本机 forwarder 子进程的启停与配置原子换入：
//! 备份 → 写盘 → `check -c` 验证 → 失败恢复备份 → 成功后重启生效。
//! 所有状态变更操作串行（op_lock），换入期间运行中的进程不受影响。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};

use crate::forwarder::ForwarderConfig;

/// 停止进程时等待退出的上限
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// 重启时停止与启动之间的间隔
const RESTART_PAUSE: Duration = Duration::from_secs(1);

pub struct ForwarderSupervisor {
    binary_path: String,
    config_path: PathBuf,
    /// 与退出监控任务共享
    running: Arc<AtomicBool>,
    pid: Arc<AtomicU32>,
    current_config: RwLock<Option<ForwarderConfig>>,
    exit_rx: RwLock<Option<watch::Receiver<bool>>>,
    /// 串行化 Start/Stop/Restart/UpdateConfig
    op_lock: Mutex<()>,
}

impl ForwarderSupervisor {
    pub fn new(binary_path: &str, config_path: &str) -> Self {
        Self {
            binary_path: binary_path.to_string(),
            config_path: PathBuf::from(config_path),
            running: Arc::new(AtomicBool::new(false)),
            pid: Arc::new(AtomicU32::new(0)),
            current_config: RwLock::new(None),
            exit_rx: RwLock::new(None),
            op_lock: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 获取内存中的当前配置
    pub async fn get_config(&self) -> Option<ForwarderConfig> {
        self.current_config.read().await.clone()
    }

    /// 从磁盘加载配置并更新内存
    pub async fn load_config_from_file(&self) -> Result<ForwarderConfig> {
        let data = tokio::fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", self.config_path.display()))?;
        let config: ForwarderConfig =
            serde_json::from_str(&data).context("解析配置文件失败")?;
        *self.current_config.write().await = Some(config.clone());
        Ok(config)
    }

    /// 启动 forwarder 进程
    pub async fn start(&self) -> Result<()> {
        let guard = self.op_lock.lock().await;
        self.start_locked(&guard).await
    }

    async fn start_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<()> {
        if self.is_running() {
            bail!("forwarder 已在运行");
        }

        if !self.config_path.exists() {
            bail!("配置文件不存在: {}", self.config_path.display());
        }

        let mut child = Command::new(&self.binary_path)
            .arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .with_context(|| format!("启动 forwarder 失败: {}", self.binary_path))?;

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (exit_tx, exit_rx) = watch::channel(false);
        *self.exit_rx.write().await = Some(exit_rx);

        info!("forwarder 进程已启动, PID: {}", pid);

        // 进程退出监控
        let running = self.running.clone();
        let monitored_pid = self.pid.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            running.store(false, Ordering::SeqCst);
            monitored_pid.store(0, Ordering::SeqCst);
            let _ = exit_tx.send(true);

            match status {
                Ok(s) if s.success() => info!("forwarder 进程正常退出"),
                Ok(s) => error!("forwarder 进程异常退出: {}", s),
                Err(e) => error!("等待 forwarder 进程失败: {}", e),
            }
        });

        Ok(())
    }

    /// 停止 forwarder 进程，先 SIGTERM 等待，超时后强杀。对未运行状态幂等。
    pub async fn stop(&self) -> Result<()> {
        let guard = self.op_lock.lock().await;
        self.stop_locked(&guard).await
    }

    async fn stop_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        if self.wait_exit(STOP_TIMEOUT).await {
            info!("forwarder 进程已停止");
            return Ok(());
        }

        // 超时，强制终止
        warn!("forwarder 停止超时，强制终止 (PID: {})", pid);
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        self.wait_exit(Duration::from_secs(2)).await;
        self.running.store(false, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// 等待退出监控发出信号
    async fn wait_exit(&self, timeout: Duration) -> bool {
        let rx = self.exit_rx.read().await.clone();
        let Some(mut rx) = rx else {
            return !self.is_running();
        };
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, rx.changed()).await.is_ok()
    }

    /// 重启 forwarder 进程
    pub async fn restart(&self) -> Result<()> {
        let guard = self.op_lock.lock().await;
        self.restart_locked(&guard).await
    }

    async fn restart_locked(&self, guard: &MutexGuard<'_, ()>) -> Result<()> {
        self.stop_locked(guard).await?;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start_locked(guard).await
    }

    /// 原子换入新配置
    ///
    /// 备份 → 写盘 → 外部验证 → 失败恢复（运行中的进程不动）→ 成功后重启生效。
    /// 未运行时只落盘，下次 Start 使用新配置。
    pub async fn update_config(&self, config: &ForwarderConfig) -> Result<()> {
        let guard = self.op_lock.lock().await;

        // 1. 备份当前配置
        let backup_path = self.backup_path();
        if self.config_path.exists() {
            if let Err(e) = std::fs::copy(&self.config_path, &backup_path) {
                warn!("备份配置失败: {}", e);
            }
        }

        // 2. 写入新配置
        let data = serde_json::to_string_pretty(config).context("序列化配置失败")?;
        self.write_config_file(&data)?;

        // 3. 调用 forwarder 二进制验证
        if let Err(e) = self.validate_config().await {
            // 验证失败，恢复备份，运行中的进程不受影响
            if backup_path.exists() {
                if let Err(restore_err) = std::fs::copy(&backup_path, &self.config_path) {
                    error!("恢复备份配置失败: {}", restore_err);
                }
            }
            return Err(anyhow!("配置验证失败: {}", e));
        }

        // 4. 更新内存配置
        *self.current_config.write().await = Some(config.clone());

        // 5. 运行中则重启生效
        if self.is_running() {
            self.restart_locked(&guard).await?;
        }

        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        let mut path = self.config_path.as_os_str().to_owned();
        path.push(".backup");
        PathBuf::from(path)
    }

    fn write_config_file(&self, data: &str) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        std::fs::write(&self.config_path, data)
            .with_context(|| format!("写入配置文件失败: {}", self.config_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.config_path, std::fs::Permissions::from_mode(0o644))
                .ok();
        }
        Ok(())
    }

    async fn validate_config(&self) -> Result<()> {
        let output = Command::new(&self.binary_path)
            .arg("check")
            .arg("-c")
            .arg(&self.config_path)
            .output()
            .await
            .with_context(|| format!("执行配置检查失败: {}", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{}", stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor_with(binary: &str, dir: &TempDir) -> Arc<ForwarderSupervisor> {
        let config_path = dir.path().join("sing-box.json");
        Arc::new(ForwarderSupervisor::new(
            binary,
            config_path.to_str().unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_start_refuses_without_config() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with("/bin/true", &dir);
        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("配置文件不存在"));
    }

    #[tokio::test]
    async fn test_restart_without_config_fails() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with("/bin/true", &dir);
        // 未运行时 restart = 幂等 stop + start，配置缺失导致 start 报错
        let err = supervisor.restart().await.unwrap_err();
        assert!(err.to_string().contains("配置文件不存在"));
        assert_eq!(supervisor.get_pid(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_not_running() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with("/bin/true", &dir);
        assert!(!supervisor.is_running());
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_config_writes_when_validation_passes() {
        let dir = TempDir::new().unwrap();
        // /bin/true 吞掉 check 参数并返回 0，模拟验证通过
        let supervisor = supervisor_with("/bin/true", &dir);

        let config = ForwarderConfig::default_base();
        supervisor.update_config(&config).await.unwrap();

        let on_disk = std::fs::read_to_string(supervisor.config_path()).unwrap();
        let parsed: ForwarderConfig = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(supervisor.get_config().await, Some(config));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_update_config_restores_backup_on_validation_failure() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with("/bin/false", &dir);

        let original = r#"{"log":{"level":"info"}}"#;
        std::fs::write(supervisor.config_path(), original).unwrap();

        let err = supervisor
            .update_config(&ForwarderConfig::default_base())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("配置验证失败"));

        // 磁盘内容与调用前一致
        let on_disk = std::fs::read_to_string(supervisor.config_path()).unwrap();
        assert_eq!(on_disk, original);
        // 内存配置未被采纳
        assert!(supervisor.get_config().await.is_none());
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with("/bin/true", &dir);

        let raw = r#"{"outbounds":[{"type":"direct","tag":"direct"}]}"#;
        std::fs::write(supervisor.config_path(), raw).unwrap();

        let config = supervisor.load_config_from_file().await.unwrap();
        assert_eq!(config.outbounds.len(), 1);
        assert!(supervisor.get_config().await.is_some());
    }
}
