use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 节点协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeProtocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Tuic,
}

impl NodeProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeProtocol::Vless => "vless",
            NodeProtocol::Vmess => "vmess",
            NodeProtocol::Trojan => "trojan",
            NodeProtocol::Shadowsocks => "shadowsocks",
            NodeProtocol::Hysteria2 => "hysteria2",
            NodeProtocol::Tuic => "tuic",
        }
    }
}

impl fmt::Display for NodeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSecurity {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub flow: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub encryption: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub alter_id: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plugin: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plugin_opts: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
}

/// 传输层：ws / grpc / http / tcp(+http 伪装)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTransport {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub header_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTls {
    #[serde(skip_serializing_if = "is_false")]
    pub enabled: bool,
    /// tls / reality
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(skip_serializing_if = "is_false")]
    pub insecure: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reality_public_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reality_short_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
}

impl NodeTls {
    pub fn is_reality(&self) -> bool {
        self.kind.eq_ignore_ascii_case("reality") || !self.reality_public_key.is_empty()
    }
}

/// 出站服务器定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: NodeProtocol,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<NodeSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<NodeTransport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<NodeTls>,
    /// 所属订阅；为空表示独立节点
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_config_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_key: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(name: &str, address: &str, port: u16, protocol: NodeProtocol) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.to_string(),
            address: address.to_string(),
            port,
            protocol,
            tags: Vec::new(),
            security: None,
            transport: None,
            tls: None,
            source_config_id: String::new(),
            source_key: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn security(&self) -> NodeSecurity {
        self.security.clone().unwrap_or_default()
    }

    /// 出站标签：`node-` + ID 前 8 位
    pub fn outbound_tag(&self) -> String {
        outbound_tag_for(&self.id)
    }

    /// Hysteria2 / TUIC / 带插件的 Shadowsocks 只有 sing-box 支持
    pub fn requires_singbox(&self) -> bool {
        match self.protocol {
            NodeProtocol::Hysteria2 | NodeProtocol::Tuic => true,
            NodeProtocol::Shadowsocks => self
                .security
                .as_ref()
                .map(|s| !s.plugin.trim().is_empty())
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("node name is required".into());
        }
        if self.address.trim().is_empty() {
            return Err("node address is required".into());
        }
        if self.port == 0 {
            return Err("node port must be in 1-65535".into());
        }
        Ok(())
    }
}

pub fn outbound_tag_for(id: &str) -> String {
    let short: String = id.chars().take(8).collect();
    format!("node-{}", short)
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_serializes_lowercase() {
        let json = serde_json::to_string(&NodeProtocol::Hysteria2).unwrap();
        assert_eq!(json, "\"hysteria2\"");
    }

    #[test]
    fn shadowsocks_plugin_needs_singbox() {
        let mut node = Node::new("ss", "1.2.3.4", 8388, NodeProtocol::Shadowsocks);
        assert!(!node.requires_singbox());
        node.security = Some(NodeSecurity {
            plugin: "v2ray-plugin".into(),
            ..Default::default()
        });
        assert!(node.requires_singbox());
    }

    #[test]
    fn outbound_tag_uses_id_prefix() {
        let mut node = Node::new("a", "h", 1, NodeProtocol::Vless);
        node.id = "b831381d-6324-4d53-ad4f-8cda48b30811".into();
        assert_eq!(node.outbound_tag(), "node-b831381d");
    }

    #[test]
    fn camel_case_roundtrip_fields() {
        let json = r#"{
            "id": "n1", "name": "n", "address": "example.com", "port": 443,
            "protocol": "vless",
            "tls": {"enabled": true, "type": "reality", "realityPublicKey": "pk"},
            "transport": {"type": "ws", "path": "/ws"}
        }"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert!(node.tls.as_ref().unwrap().is_reality());
        assert_eq!(node.transport.as_ref().unwrap().kind, "ws");
        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["tls"]["realityPublicKey"], "pk");
    }
}
