use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CoreComponent, FRouter, Node, ProxyConfig};

/// 当前快照版本
pub const SCHEMA_VERSION: &str = "2.1.0";
/// 可在内存中迁移的旧版本（FRouter 内嵌 nodes）
pub const LEGACY_SCHEMA_VERSION: &str = "2.0.0";

/// 订阅 / 配置源记录（本 crate 只负责存取）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub id: String,
    pub name: String,
    #[serde(default = "default_config_format")]
    pub format: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_sync_error: String,
    /// 自动更新间隔（秒）
    #[serde(default)]
    pub auto_update_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_config_format() -> String {
    "subscription".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoResourceType {
    Geoip,
    Geosite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoResource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: GeoResourceType,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artifact_path: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemProxySettings {
    pub enabled: bool,
    pub ignore_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// 持久化快照的外层信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub frouters: Vec<FRouter>,
    #[serde(default)]
    pub configs: Vec<Config>,
    #[serde(default)]
    pub geo_resources: Vec<GeoResource>,
    #[serde(default)]
    pub components: Vec<CoreComponent>,
    #[serde(default)]
    pub system_proxy: SystemProxySettings,
    #[serde(default)]
    pub proxy_config: ProxyConfig,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub frontend_settings: serde_json::Map<String, serde_json::Value>,
    pub generated_at: DateTime<Utc>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            nodes: Vec::new(),
            frouters: Vec::new(),
            configs: Vec::new(),
            geo_resources: Vec::new(),
            components: Vec::new(),
            system_proxy: SystemProxySettings::default(),
            proxy_config: ProxyConfig::default(),
            frontend_settings: serde_json::Map::new(),
            generated_at: Utc::now(),
        }
    }
}
