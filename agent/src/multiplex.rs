//! 出站多路复用配置应用
//!
//! 把 Controller 下发的多路复用参数写到匹配协议的出站上，或从当前配置中读取。

use anyhow::{bail, Result};

use common::grpc::xbox;

use crate::forwarder::{BrutalOptions, ForwarderConfig, MultiplexOptions};

/// 支持多路复用的出站协议
pub const MULTIPLEX_PROTOCOLS: [&str; 4] = ["vmess", "vless", "trojan", "shadowsocks"];

pub fn is_multiplex_protocol(protocol: &str) -> bool {
    MULTIPLEX_PROTOCOLS.contains(&protocol)
}

/// 将多路复用配置应用到所有匹配协议的出站，返回受影响的出站 tag
///
/// enabled=false 时移除出站上的 multiplex 子对象。
pub fn apply_multiplex(
    config: &mut ForwarderConfig,
    protocol: &str,
    request: &xbox::MultiplexConfig,
) -> Result<Vec<String>> {
    if !is_multiplex_protocol(protocol) {
        bail!("不支持的协议类型: {}", protocol);
    }

    let options = if request.enabled {
        Some(MultiplexOptions {
            enabled: true,
            // 内层协议固定为 smux
            protocol: "smux".to_string(),
            max_connections: request.max_connections,
            min_streams: request.min_streams,
            padding: request.padding,
            brutal: request.brutal.as_ref().filter(|b| b.enabled).map(|b| BrutalOptions {
                enabled: true,
                up: b.up.clone(),
                down: b.down.clone(),
            }),
        })
    } else {
        None
    };

    let mut updated = Vec::new();
    for outbound in config.outbounds.iter_mut() {
        if outbound.outbound_type == protocol {
            outbound.multiplex = options.clone();
            updated.push(outbound.tag.clone());
        }
    }

    if updated.is_empty() {
        bail!("未找到协议为 {} 的出站配置", protocol);
    }

    Ok(updated)
}

/// 从配置中提取指定协议的多路复用状态；protocol 为空时返回全部支持的协议
pub fn extract_multiplex(
    config: &ForwarderConfig,
    protocol: &str,
) -> Vec<xbox::ProtocolMultiplex> {
    let protocols: Vec<&str> = if protocol.is_empty() {
        MULTIPLEX_PROTOCOLS.to_vec()
    } else {
        vec![protocol]
    };

    let mut result = Vec::new();
    for proto in protocols {
        for outbound in &config.outbounds {
            if outbound.outbound_type != proto {
                continue;
            }
            let Some(multiplex) = &outbound.multiplex else {
                continue;
            };
            result.push(xbox::ProtocolMultiplex {
                protocol: proto.to_string(),
                enabled: multiplex.enabled,
                multiplex_config: Some(xbox::MultiplexConfig {
                    enabled: multiplex.enabled,
                    protocol: multiplex.protocol.clone(),
                    max_connections: multiplex.max_connections,
                    min_streams: multiplex.min_streams,
                    padding: multiplex.padding,
                    brutal: multiplex.brutal.as_ref().map(|b| xbox::BrutalConfig {
                        enabled: b.enabled,
                        up: b.up.clone(),
                        down: b.down.clone(),
                    }),
                }),
                last_updated: String::new(),
            });
            break;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::Outbound;

    fn config_with_vmess() -> ForwarderConfig {
        let mut config = ForwarderConfig::default_base();
        config.outbounds.push(Outbound {
            outbound_type: "vmess".to_string(),
            tag: "proxy-out".to_string(),
            server: "1.2.3.4".to_string(),
            server_port: 443,
            ..Default::default()
        });
        config
    }

    fn request(enabled: bool) -> xbox::MultiplexConfig {
        xbox::MultiplexConfig {
            enabled,
            protocol: "smux".to_string(),
            max_connections: 8,
            min_streams: 4,
            padding: true,
            brutal: None,
        }
    }

    #[test]
    fn test_apply_sets_multiplex_on_matching_outbound() {
        let mut config = config_with_vmess();
        let updated = apply_multiplex(&mut config, "vmess", &request(true)).unwrap();
        assert_eq!(updated, vec!["proxy-out".to_string()]);

        let outbound = config
            .outbounds
            .iter()
            .find(|o| o.outbound_type == "vmess")
            .unwrap();
        let multiplex = outbound.multiplex.as_ref().unwrap();
        assert_eq!(multiplex.protocol, "smux");
        assert_eq!(multiplex.max_connections, 8);
        assert!(multiplex.padding);
    }

    #[test]
    fn test_apply_disabled_removes_multiplex() {
        let mut config = config_with_vmess();
        apply_multiplex(&mut config, "vmess", &request(true)).unwrap();
        apply_multiplex(&mut config, "vmess", &request(false)).unwrap();

        let outbound = config
            .outbounds
            .iter()
            .find(|o| o.outbound_type == "vmess")
            .unwrap();
        assert!(outbound.multiplex.is_none());
    }

    #[test]
    fn test_apply_rejects_unsupported_protocol() {
        let mut config = config_with_vmess();
        let err = apply_multiplex(&mut config, "http", &request(true)).unwrap_err();
        assert!(err.to_string().contains("不支持的协议类型"));
    }

    #[test]
    fn test_apply_rejects_missing_outbound() {
        let mut config = ForwarderConfig::default_base();
        let err = apply_multiplex(&mut config, "trojan", &request(true)).unwrap_err();
        assert!(err.to_string().contains("未找到协议为"));
    }

    #[test]
    fn test_extract_multiplex() {
        let mut config = config_with_vmess();
        apply_multiplex(&mut config, "vmess", &request(true)).unwrap();

        let all = extract_multiplex(&config, "");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].protocol, "vmess");
        assert!(all[0].enabled);

        let none = extract_multiplex(&config, "trojan");
        assert!(none.is_empty());
    }
}
