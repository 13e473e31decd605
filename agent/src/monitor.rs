//! 系统指标采集
//!
//! 心跳携带的资源指标快照：CPU、内存、磁盘、运行时长、本机 IP。

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Mutex;

use chrono::Utc;
use sysinfo::{Disks, System};

pub struct SystemMonitor {
    sys: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self {
            sys: Mutex::new(sys),
        }
    }

    /// 获取本机非回环 IPv4 地址
    ///
    /// 通过向公网地址"拨号"取本地出口地址，不产生实际流量。
    pub fn local_ip(&self) -> String {
        let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
            return "unknown".to_string();
        };
        if socket.connect("8.8.8.8:80").is_err() {
            return "unknown".to_string();
        }
        match socket.local_addr() {
            Ok(addr) => addr.ip().to_string(),
            Err(_) => "unknown".to_string(),
        }
    }

    /// CPU 使用率（百分比）
    pub fn cpu_usage(&self) -> f32 {
        let mut sys = self.sys.lock().unwrap();
        sys.refresh_cpu_usage();
        sys.global_cpu_usage()
    }

    /// 已用内存（字节）
    pub fn memory_usage(&self) -> u64 {
        let mut sys = self.sys.lock().unwrap();
        sys.refresh_memory();
        sys.used_memory()
    }

    /// 磁盘使用率（百分比，所有磁盘合计）
    pub fn disk_usage(&self) -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let mut total = 0u64;
        let mut available = 0u64;
        for disk in disks.list() {
            total += disk.total_space();
            available += disk.available_space();
        }
        if total == 0 {
            return 0.0;
        }
        (total - available) as f64 / total as f64 * 100.0
    }

    /// 系统信息（注册时随 metadata 上报）
    pub fn system_info(&self) -> HashMap<String, String> {
        let mut info = HashMap::new();
        info.insert(
            "hostname".to_string(),
            System::host_name().unwrap_or_else(|| "unknown".to_string()),
        );
        info.insert("os".to_string(), std::env::consts::OS.to_string());
        info.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        info.insert(
            "cpu_cores".to_string(),
            std::thread::available_parallelism()
                .map(|n| n.get().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        );
        info
    }

    /// 采集心跳指标
    pub fn collect_metrics(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("cpu_usage".to_string(), format!("{:.2}", self.cpu_usage()));
        metrics.insert("memory_usage".to_string(), self.memory_usage().to_string());
        metrics.insert("disk_usage".to_string(), format!("{:.2}", self.disk_usage()));
        metrics.insert("uptime".to_string(), System::uptime().to_string());
        metrics.insert("local_ip".to_string(), self.local_ip());
        metrics.insert("timestamp".to_string(), Utc::now().to_rfc3339());

        for (k, v) in self.system_info() {
            metrics.insert(k, v);
        }

        metrics
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_metrics_has_required_keys() {
        let monitor = SystemMonitor::new();
        let metrics = monitor.collect_metrics();
        for key in ["cpu_usage", "memory_usage", "disk_usage", "uptime", "timestamp", "hostname"] {
            assert!(metrics.contains_key(key), "missing {}", key);
        }
    }
}
