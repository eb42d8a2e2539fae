//! 内核适配器
//!
//! 每种内核一个实现：声明支持的协议与入站、由 RuntimePlan 生成配置字节、
//! 给出命令行参数。进程的启动、停止与就绪探测默认走 [`process`] 中的通用实现。

pub mod clash;
pub mod process;
pub mod singbox;
pub mod xray;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::platform;
use crate::common::Result;
use crate::compiler::{Action, RuntimePlan};
use crate::config::Paths;
use crate::domain::node::outbound_tag_for;
use crate::domain::{EngineKind, InboundMode, NodeProtocol, ProxyConfig};

pub use process::{LogSink, ProcessConfig, ProcessHandle};

/// 生成配置时引用的本地数据文件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoFiles {
    /// 存在时才会被引用
    pub geoip: Option<PathBuf>,
    pub geosite: Option<PathBuf>,
    /// sing-box `.srs` 目录
    pub rule_set_dir: PathBuf,
}

impl GeoFiles {
    /// 按目录布局探测已有文件
    pub fn discover(paths: &Paths) -> Self {
        let geo_dir = paths.geo_dir();
        let existing = |name: &str| {
            let p = geo_dir.join(name);
            p.is_file().then_some(p)
        };
        Self {
            geoip: existing("geoip.dat"),
            geosite: existing("geosite.dat"),
            rule_set_dir: paths.rule_set_dir(),
        }
    }

    pub fn geo_dir(&self) -> Option<&Path> {
        self.geosite
            .as_deref()
            .or(self.geoip.as_deref())
            .and_then(Path::parent)
    }
}

#[async_trait]
pub trait CoreAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// 候选可执行文件名，按优先级排列
    fn binary_names(&self) -> &'static [&'static str];

    fn supported_protocols(&self) -> &'static [NodeProtocol];

    fn supports_protocol(&self, protocol: NodeProtocol) -> bool {
        self.supported_protocols().contains(&protocol)
    }

    fn supports_inbound(&self, mode: InboundMode) -> bool;

    fn config_file_name(&self) -> &'static str {
        "config.json"
    }

    /// 纯函数：同样的输入得到同样的字节
    fn build_config(&self, plan: &RuntimePlan, geo: &GeoFiles) -> Result<Vec<u8>>;

    fn requires_privileges(&self, _cfg: &ProxyConfig) -> bool {
        false
    }

    fn command_args(&self, config_path: &Path) -> Vec<String>;

    /// 按引擎习惯修正 TUN 参数（只改动用户未定制的默认值）
    fn tune(&self, _cfg: &mut ProxyConfig) {}

    /// 额外的子进程环境变量
    fn process_env(&self, _geo: &GeoFiles) -> Vec<(String, String)> {
        Vec::new()
    }

    /// 就绪探测端口；0 表示没有本地代理端口
    fn probe_port(&self, cfg: &ProxyConfig) -> u16 {
        if cfg.inbound_mode.is_tun() {
            0
        } else {
            cfg.inbound_port
        }
    }

    async fn start(&self, cfg: &ProcessConfig, config_path: &Path) -> Result<Arc<ProcessHandle>> {
        process::spawn(cfg, &self.command_args(config_path), config_path)
    }

    async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> Result<()> {
        process::terminate(handle, grace).await;
        Ok(())
    }

    async fn wait_for_ready(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()> {
        process::wait_for_port(handle, timeout).await
    }
}

/// 按引擎分派的适配器表
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<EngineKind, Arc<dyn CoreAdapter>>,
}

impl AdapterSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 三种内置引擎
    pub fn defaults() -> Self {
        Self::empty()
            .with(Arc::new(xray::XrayAdapter))
            .with(Arc::new(singbox::SingBoxAdapter))
            .with(Arc::new(clash::ClashAdapter))
    }

    /// 注册或替换同类型适配器
    pub fn with(mut self, adapter: Arc<dyn CoreAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn CoreAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<EngineKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

// ─── 公共小工具 ───

/// TUN 入站在非特权用户下需要额外能力
pub(crate) fn tun_requires_privileges(cfg: &ProxyConfig) -> bool {
    cfg.inbound_mode.is_tun() && !platform::is_root()
}

/// Xray / sing-box 共用的出站标签
pub(crate) fn action_tag(action: &Action) -> String {
    match action {
        Action::Node(id) => outbound_tag_for(id),
        Action::Direct => "direct".to_string(),
        Action::Block => "block".to_string(),
    }
}

/// 规则里的一个域名条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DomainMatch<'a> {
    Geosite(&'a str),
    Geoip(&'a str),
    Full(&'a str),
    Suffix(&'a str),
    Keyword(&'a str),
    Regex(&'a str),
}

pub(crate) fn parse_domain(entry: &str) -> Option<DomainMatch<'_>> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    let parsed = if let Some(v) = entry.strip_prefix("geosite:") {
        DomainMatch::Geosite(v)
    } else if let Some(v) = entry.strip_prefix("geoip:") {
        DomainMatch::Geoip(v)
    } else if let Some(v) = entry.strip_prefix("full:") {
        DomainMatch::Full(v)
    } else if let Some(v) = entry.strip_prefix("domain:") {
        DomainMatch::Suffix(v)
    } else if let Some(v) = entry.strip_prefix("keyword:") {
        DomainMatch::Keyword(v)
    } else if let Some(v) = entry.strip_prefix("regexp:") {
        DomainMatch::Regex(v)
    } else {
        DomainMatch::Suffix(entry)
    };
    Some(parsed)
}

/// 规则里的一个 IP 条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IpMatch<'a> {
    Private,
    Geoip(&'a str),
    Cidr(&'a str),
}

pub(crate) fn parse_ip(entry: &str) -> Option<IpMatch<'_>> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    match entry.strip_prefix("geoip:") {
        Some(v) if v.eq_ignore_ascii_case("private") => Some(IpMatch::Private),
        Some(v) => Some(IpMatch::Geoip(v)),
        None => Some(IpMatch::Cidr(entry)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
