//! 节点 IP 段检测
//!
//! 通过公共服务探测公网 IP，查询地理位置，并推导 /24 IP 段。
//! IP 未变化时直接返回缓存，避免心跳期间反复请求外部服务。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use common::grpc::xbox;

/// 公网 IP 探测服务，依次尝试
const IP_SERVICES: [&str; 4] = [
    "https://ipv4.icanhazip.com",
    "https://api.ipify.org",
    "https://ipinfo.io/ip",
    "https://checkip.amazonaws.com",
];

pub struct IpRangeDetector {
    client: reqwest::Client,
    cached: Mutex<Option<(String, xbox::IpRangeInfo)>>,
}

/// ipwhois.app 响应
#[derive(Debug, Deserialize)]
struct IpWhoisResponse {
    ip: Option<String>,
    success: Option<bool>,
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    isp: Option<String>,
}

impl IpRangeDetector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("Xbox-Agent/1.0")
                .build()
                .expect("failed to build http client"),
            cached: Mutex::new(None),
        }
    }

    /// 检测当前节点的 IP 段信息，IP 不变时复用缓存
    pub async fn detect(&self) -> Result<xbox::IpRangeInfo> {
        let public_ip = self.public_ip().await?;

        {
            let cached = self.cached.lock().await;
            if let Some((ip, info)) = cached.as_ref() {
                if *ip == public_ip {
                    debug!("公网 IP 未变化，使用缓存的 IP 段信息");
                    return Ok(info.clone());
                }
            }
        }

        let mut info = self.geolocate(&public_ip).await?;
        info.ip_range = ip_range_of(&public_ip).unwrap_or_default();
        info.detection_method = "auto".to_string();
        info.detected_at = Utc::now().to_rfc3339();

        *self.cached.lock().await = Some((public_ip, info.clone()));
        Ok(info)
    }

    /// 获取缓存的 IP 段信息
    pub async fn cached_info(&self) -> Option<xbox::IpRangeInfo> {
        self.cached.lock().await.as_ref().map(|(_, info)| info.clone())
    }

    /// 获取公网 IP，多个服务依次降级
    pub async fn public_ip(&self) -> Result<String> {
        for service in IP_SERVICES {
            match self.fetch_ip(service).await {
                Ok(ip) if !ip.is_empty() => {
                    debug!("从 {} 获取到公网 IP: {}", service, ip);
                    return Ok(ip);
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("从 {} 获取公网 IP 失败: {}", service, e);
                    continue;
                }
            }
        }
        Err(anyhow!("无法从任何服务获取公网 IP"))
    }

    async fn fetch_ip(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("HTTP 状态码: {}", response.status()));
        }
        Ok(response.text().await?.trim().to_string())
    }

    /// 查询 IP 地理位置（ipwhois.app，每月 10k 次免费额度）
    async fn geolocate(&self, ip: &str) -> Result<xbox::IpRangeInfo> {
        let url = format!(
            "https://ipwhois.app/json/{}?objects=ip,success,country,region,city,isp",
            ip
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("请求 IP 地理位置 API 失败: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("IP 地理位置 API 返回错误状态: {}", response.status()));
        }

        let api_response: IpWhoisResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("解析 IP 地理位置响应失败: {}", e))?;

        if api_response.success == Some(false) {
            return Err(anyhow!("IP 地理位置查询失败"));
        }

        let info = xbox::IpRangeInfo {
            ip_range: String::new(),
            country: api_response.country.unwrap_or_else(|| "Unknown".to_string()),
            region: api_response.region.unwrap_or_else(|| "Unknown".to_string()),
            city: api_response.city.unwrap_or_else(|| "Unknown".to_string()),
            isp: api_response.isp.unwrap_or_else(|| "Unknown".to_string()),
            detection_method: String::new(),
            detected_at: String::new(),
        };

        info!(
            "查询到 IP {} 的地理位置: {}-{}-{}",
            api_response.ip.unwrap_or_else(|| ip.to_string()),
            info.country,
            info.region,
            info.city
        );

        Ok(info)
    }
}

impl Default for IpRangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// 未知地理位置的占位信息，检测失败时不阻塞注册流程
pub fn unknown_ip_range_info() -> xbox::IpRangeInfo {
    xbox::IpRangeInfo {
        ip_range: String::new(),
        country: "Unknown".to_string(),
        region: "Unknown".to_string(),
        city: "Unknown".to_string(),
        isp: "Unknown".to_string(),
        detection_method: "none".to_string(),
        detected_at: Utc::now().to_rfc3339(),
    }
}

/// 由 IP 地址推导 CIDR 段：IPv4 按地址类划分，IPv6 取前 64 位
fn ip_range_of(ip: &str) -> Option<String> {
    match ip.parse::<IpAddr>().ok()? {
        IpAddr::V4(addr) => Some(ipv4_range_of(addr, ip)),
        IpAddr::V6(addr) => Some(ipv6_range_of(addr)),
    }
}

fn ipv4_range_of(addr: Ipv4Addr, raw: &str) -> String {
    let octets = addr.octets();
    match octets[0] {
        // A 类
        1..=126 => format!("{}.0.0.0/8", octets[0]),
        // B 类
        128..=191 => format!("{}.{}.0.0/16", octets[0], octets[1]),
        // C 类
        192..=223 => format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]),
        // D 类组播及其余按单个地址处理
        _ => format!("{}/32", raw),
    }
}

/// 后 64 位置零，得到 /64 子网
fn ipv6_range_of(addr: Ipv6Addr) -> String {
    let mut octets = addr.octets();
    for octet in octets.iter_mut().skip(8) {
        *octet = 0;
    }
    format!("{}/64", Ipv6Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_range_is_classful() {
        // A 类
        assert_eq!(ip_range_of("8.8.8.8"), Some("8.0.0.0/8".to_string()));
        assert_eq!(ip_range_of("10.1.2.3"), Some("10.0.0.0/8".to_string()));
        // B 类
        assert_eq!(ip_range_of("172.16.5.9"), Some("172.16.0.0/16".to_string()));
        // C 类
        assert_eq!(ip_range_of("192.168.1.42"), Some("192.168.1.0/24".to_string()));
        // D 类组播与回环都按单个地址处理
        assert_eq!(ip_range_of("224.0.0.1"), Some("224.0.0.1/32".to_string()));
        assert_eq!(ip_range_of("127.0.0.1"), Some("127.0.0.1/32".to_string()));
    }

    #[test]
    fn test_ipv6_range_zeroes_low_bits() {
        assert_eq!(
            ip_range_of("2001:db8:1:2:3:4:5:6"),
            Some("2001:db8:1:2::/64".to_string())
        );
        assert_eq!(ip_range_of("::1"), Some("::/64".to_string()));
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert_eq!(ip_range_of("not-an-ip"), None);
        assert_eq!(ip_range_of("300.1.2.3"), None);
    }
}
