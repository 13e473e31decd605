//! forwarder（sing-box）配置文档模型
//!
//! 只建模本系统需要读写的部分：log / dns / inbounds / outbounds / route.rules，
//! 其余运维人员手写的字段通过 `#[serde(flatten)]` 原样保留，配置换入换出不丢字段。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// forwarder 配置文档
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ForwarderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbounds: Vec<Inbound>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<Outbound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteSection>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogSection {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timestamp: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DnsSection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<DnsServer>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub strategy: String,
    #[serde(rename = "final", default, skip_serializing_if = "String::is_empty")]
    pub final_server: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DnsServer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub inbound_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub listen: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub listen_port: u16,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub outbound_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub server_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplex: Option<MultiplexOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 出站多路复用配置，内层协议固定为 smux
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MultiplexOptions {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub max_connections: i32,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub min_streams: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub padding: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brutal: Option<BrutalOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrutalOptions {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub up: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub down: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteSection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,
    #[serde(rename = "final", default, skip_serializing_if = "String::is_empty")]
    pub final_outbound: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 路由规则，过滤器生成的规则只使用 protocol/domain/ip_cidr/port/outbound
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_cidr: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port: Vec<String>,
    pub outbound: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

impl ForwarderConfig {
    /// 默认基础配置：socks/http 入站，direct/block 出站，空路由
    pub fn default_base() -> Self {
        Self {
            log: Some(LogSection {
                disabled: false,
                level: "info".to_string(),
                output: String::new(),
                timestamp: true,
            }),
            dns: Some(DnsSection {
                servers: vec![
                    DnsServer {
                        tag: "cloudflare".to_string(),
                        address: "1.1.1.1".to_string(),
                        extra: Map::new(),
                    },
                    DnsServer {
                        tag: "local".to_string(),
                        address: "223.5.5.5".to_string(),
                        extra: Map::new(),
                    },
                ],
                strategy: String::new(),
                final_server: String::new(),
                extra: Map::new(),
            }),
            inbounds: vec![
                Inbound {
                    inbound_type: "socks".to_string(),
                    tag: "socks".to_string(),
                    listen: "127.0.0.1".to_string(),
                    listen_port: 1080,
                    extra: Map::new(),
                },
                Inbound {
                    inbound_type: "http".to_string(),
                    tag: "http".to_string(),
                    listen: "127.0.0.1".to_string(),
                    listen_port: 8888,
                    extra: Map::new(),
                },
            ],
            outbounds: vec![
                Outbound {
                    outbound_type: "direct".to_string(),
                    tag: "direct".to_string(),
                    ..Default::default()
                },
                Outbound {
                    outbound_type: "block".to_string(),
                    tag: "block".to_string(),
                    ..Default::default()
                },
            ],
            route: Some(RouteSection::default()),
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let raw = r#"{
            "log": {"level": "warn"},
            "outbounds": [
                {"type": "vmess", "tag": "proxy", "server": "1.2.3.4", "server_port": 443,
                 "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811", "security": "auto"}
            ],
            "route": {"rules": [{"outbound": "direct", "ip_is_private": true}]},
            "experimental": {"cache_file": {"enabled": true}}
        }"#;

        let config: ForwarderConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.outbounds[0].outbound_type, "vmess");
        // 未建模字段保留在 extra 中
        assert!(config.outbounds[0].extra.contains_key("uuid"));
        assert!(config.extra.contains_key("experimental"));

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["outbounds"][0]["uuid"], "b831381d-6324-4d53-ad4f-8cda48b30811");
        assert_eq!(out["experimental"]["cache_file"]["enabled"], true);
        assert_eq!(out["route"]["rules"][0]["ip_is_private"], true);
    }

    #[test]
    fn test_default_base_has_block_outbound() {
        let config = ForwarderConfig::default_base();
        assert!(config.outbounds.iter().any(|o| o.outbound_type == "block"));
        assert!(config.outbounds.iter().any(|o| o.outbound_type == "direct"));
        assert_eq!(config.inbounds.len(), 2);
    }

    #[test]
    fn test_multiplex_serialization_skips_disabled_brutal() {
        let multiplex = MultiplexOptions {
            enabled: true,
            protocol: "smux".to_string(),
            max_connections: 8,
            min_streams: 4,
            padding: false,
            brutal: None,
        };
        let value = serde_json::to_value(&multiplex).unwrap();
        assert_eq!(value["protocol"], "smux");
        assert!(value.get("brutal").is_none());
        assert!(value.get("padding").is_none());
    }
}
