use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 内核引擎
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EngineKind {
    #[default]
    #[serde(rename = "auto", alias = "")]
    Auto,
    #[serde(rename = "xray")]
    Xray,
    #[serde(rename = "singbox", alias = "sing-box")]
    SingBox,
    #[serde(rename = "clash", alias = "mihomo")]
    Clash,
}

impl EngineKind {
    /// 具体引擎（不含 auto），按默认优先级排列
    pub const CONCRETE: [EngineKind; 3] = [EngineKind::SingBox, EngineKind::Xray, EngineKind::Clash];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Auto => "auto",
            EngineKind::Xray => "xray",
            EngineKind::SingBox => "singbox",
            EngineKind::Clash => "clash",
        }
    }

    /// artifacts 下的目录名
    pub fn dir_name(self) -> &'static str {
        match self {
            EngineKind::SingBox => "sing-box",
            other => other.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Some(EngineKind::Auto),
            "xray" => Some(EngineKind::Xray),
            "singbox" | "sing-box" => Some(EngineKind::SingBox),
            "clash" | "mihomo" => Some(EngineKind::Clash),
            _ => None,
        }
    }

    pub fn is_auto(self) -> bool {
        self == EngineKind::Auto
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 入站模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundMode {
    Socks,
    Http,
    #[default]
    #[serde(alias = "")]
    Mixed,
    Tun,
}

impl InboundMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InboundMode::Socks => "socks",
            InboundMode::Http => "http",
            InboundMode::Mixed => "mixed",
            InboundMode::Tun => "tun",
        }
    }

    pub fn is_tun(self) -> bool {
        self == InboundMode::Tun
    }
}

impl fmt::Display for InboundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundAuth {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl InboundAuth {
    pub fn is_set(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// SOCKS / HTTP / Mixed 入站细节
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundConfig {
    /// 监听地址，默认 127.0.0.1
    pub listen: String,
    pub allow_lan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<InboundAuth>,
    pub sniff: bool,
    pub sniff_override: bool,
    pub set_system_proxy: bool,
}

/// TUN 设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunSettings {
    pub interface_name: String,
    pub mtu: u32,
    pub address: Vec<String>,
    pub auto_route: bool,
    /// 仅 Linux：nftables 重定向
    pub auto_redirect: bool,
    pub strict_route: bool,
    /// system / gvisor / mixed
    pub stack: String,
    pub dns_hijack: bool,
    pub endpoint_independent_nat: bool,
    /// UDP 会话超时（秒），0 表示使用内核默认
    pub udp_timeout: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub route_address: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub route_exclude_address: Vec<String>,
}

pub const DEFAULT_TUN_INTERFACE: &str = "tun0";
pub const DEFAULT_TUN_MTU: u32 = 9000;
pub const DEFAULT_TUN_ADDRESS: &str = "172.19.0.1/30";

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_TUN_INTERFACE.to_string(),
            mtu: DEFAULT_TUN_MTU,
            address: vec![DEFAULT_TUN_ADDRESS.to_string()],
            auto_route: true,
            auto_redirect: false,
            strict_route: true,
            stack: "mixed".to_string(),
            dns_hijack: true,
            endpoint_independent_nat: false,
            udp_timeout: 0,
            route_address: Vec::new(),
            route_exclude_address: Vec::new(),
        }
    }
}

impl TunSettings {
    /// 补齐空字段
    pub fn fill_defaults(&mut self) {
        if self.interface_name.trim().is_empty() {
            self.interface_name = DEFAULT_TUN_INTERFACE.to_string();
        }
        if self.mtu == 0 {
            self.mtu = DEFAULT_TUN_MTU;
        }
        if self.address.is_empty() {
            self.address = vec![DEFAULT_TUN_ADDRESS.to_string()];
        }
        if self.stack.trim().is_empty() {
            self.stack = "mixed".to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// debug / info / warning / error / none
    pub level: String,
    pub timestamp: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamp: true,
            output: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remote_servers: Vec<String>,
    /// prefer_ipv4 / prefer_ipv6 / ipv4_only / ipv6_only
    #[serde(skip_serializing_if = "String::is_empty")]
    pub strategy: String,
}

/// 代理运行配置（单例）：描述"如何运行当前 FRouter"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub inbound_mode: InboundMode,
    /// TUN 模式下不用于主入站
    pub inbound_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_config: Option<InboundConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tun_settings: Option<TunSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<DnsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_config: Option<LogConfig>,
    pub preferred_engine: EngineKind,
    #[serde(rename = "frouterId")]
    pub frouter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProxyConfig {
    /// 入站监听地址：allowLan 时监听全部地址
    pub fn listen_address(&self) -> String {
        match &self.inbound_config {
            Some(ic) if ic.allow_lan => "0.0.0.0".to_string(),
            Some(ic) if !ic.listen.trim().is_empty() => ic.listen.trim().to_string(),
            _ => "127.0.0.1".to_string(),
        }
    }

    pub fn tun(&self) -> TunSettings {
        self.tun_settings.clone().unwrap_or_default()
    }

    pub fn tun_interface_name(&self) -> String {
        self.tun_settings
            .as_ref()
            .map(|t| t.interface_name.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_TUN_INTERFACE.to_string())
    }

    pub fn log_level(&self) -> String {
        self.log_config
            .as_ref()
            .map(|l| l.level.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "info".to_string())
    }

    pub fn auth(&self) -> Option<&InboundAuth> {
        self.inbound_config
            .as_ref()
            .and_then(|ic| ic.authentication.as_ref())
            .filter(|a| a.is_set())
    }

    pub fn sniff(&self) -> bool {
        self.inbound_config.as_ref().map(|ic| ic.sniff).unwrap_or(true)
    }
}
