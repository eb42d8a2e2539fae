use std::collections::BTreeSet;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use super::graph::CompiledFRouter;
use crate::domain::{EngineKind, Node, ProxyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Proxy,
    Measurement,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Proxy => "proxy",
            Purpose::Measurement => "measurement",
        }
    }
}

/// 引擎无关的编译产物，适配器据此生成配置文件
#[derive(Debug, Clone)]
pub struct RuntimePlan {
    pub purpose: Purpose,
    pub engine: EngineKind,
    pub proxy_config: ProxyConfig,
    pub frouter_id: String,
    pub frouter_name: String,
    /// 只包含实际用到的节点
    pub nodes: Vec<Node>,
    pub compiled: CompiledFRouter,
    /// 用户规则引用到的 sing-box rule-set 标签
    pub rule_set_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RuntimePlan {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// 排障用的可读摘要，不含凭据
    pub fn explain(&self) -> String {
        let c = &self.compiled;
        let cfg = &self.proxy_config;
        let mut out = String::new();
        let _ = writeln!(out, "purpose={}", self.purpose.as_str());
        let _ = writeln!(out, "engine={}", self.engine);
        if !self.frouter_id.is_empty() {
            let _ = writeln!(out, "frouter={}", self.frouter_id);
        }
        let _ = writeln!(out, "inboundMode={}", cfg.inbound_mode);
        if cfg.inbound_port > 0 {
            let _ = writeln!(out, "inboundPort={}", cfg.inbound_port);
        }
        let _ = writeln!(out, "nodes={}", self.nodes.len());
        let _ = writeln!(out, "routeRules={}", c.rules.len());
        let _ = writeln!(out, "detours={}", c.detour.len());
        let _ = writeln!(out, "warnings={}", c.warnings.len());
        let _ = writeln!(out, "default={}", c.default);
        for (i, rule) in c.rules.iter().enumerate() {
            let _ = writeln!(
                out,
                "rule[{}] edge={} priority={} -> {}",
                i, rule.edge_id, rule.priority, rule.action
            );
        }
        for w in &c.warnings {
            let _ = writeln!(out, "warning: {}", w);
        }
        out
    }
}

/// 从规则中收集 `geosite:x` / `geoip:x` 对应的 rule-set 标签
pub fn rule_set_tags(compiled: &CompiledFRouter) -> Vec<String> {
    let mut tags = BTreeSet::new();
    for rule in &compiled.rules {
        for d in &rule.matcher.domains {
            if let Some(name) = d.trim().strip_prefix("geosite:") {
                if !name.is_empty() {
                    tags.insert(format!("geosite-{}", name.to_ascii_lowercase()));
                }
            }
        }
        for ip in &rule.matcher.ips {
            if let Some(name) = ip.trim().strip_prefix("geoip:") {
                let name = name.to_ascii_lowercase();
                if !name.is_empty() && name != "private" {
                    tags.insert(format!("geoip-{}", name));
                }
            }
        }
    }
    tags.into_iter().collect()
}
