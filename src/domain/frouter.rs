use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 本机入口
pub const EDGE_LOCAL: &str = "local";
/// 直连动作
pub const EDGE_DIRECT: &str = "direct";
/// 阻断动作
pub const EDGE_BLOCK: &str = "block";
/// 插槽节点前缀
pub const SLOT_PREFIX: &str = "slot-";

pub fn is_slot(id: &str) -> bool {
    id.len() > SLOT_PREFIX.len() && id.starts_with(SLOT_PREFIX)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeRuleType {
    /// 默认路径（无条件）
    #[default]
    #[serde(rename = "")]
    None,
    /// 域名 / IP 规则
    #[serde(rename = "route")]
    Route,
}

impl EdgeRuleType {
    fn is_none(&self) -> bool {
        *self == EdgeRuleType::None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteMatchRule {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
}

impl RouteMatchRule {
    pub fn is_empty(&self) -> bool {
        self.domains.iter().all(|d| d.trim().is_empty()) && self.ips.iter().all(|i| i.trim().is_empty())
    }
}

/// 图中的一条边
///
/// - `local -> {node|slot|direct|block}`：选择边，可带规则、优先级和 `via` 链路
/// - `{node|slot} -> {node|slot}`：detour 边，描述上游链路
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub via: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,
    pub priority: i32,
    pub enabled: bool,
    #[serde(skip_serializing_if = "EdgeRuleType::is_none")]
    pub rule_type: EdgeRuleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_rule: Option<RouteMatchRule>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ProxyEdge {
    /// 无条件默认边：ruleType 为空且无规则，或 route 但规则为空
    pub fn is_default(&self) -> bool {
        self.route_rule.as_ref().map(|r| r.is_empty()).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlotNode {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bound_node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainProxySettings {
    pub edges: Vec<ProxyEdge>,
    /// 仅供 UI 使用
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub positions: BTreeMap<String, GraphPosition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<SlotNode>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ChainProxySettings {
    fn default() -> Self {
        Self {
            edges: Vec::new(),
            positions: BTreeMap::new(),
            slots: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// 转发路由：对外的一等操作单元，只通过边引用节点 ID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FRouter {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub chain_proxy: ChainProxySettings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_config_id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl FRouter {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.to_string(),
            chain_proxy: ChainProxySettings::default(),
            tags: Vec::new(),
            source_config_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 新建只有 `local -> direct` 默认边的路由
    pub fn with_direct_default(name: &str) -> Self {
        let mut fr = Self::new(name);
        fr.chain_proxy.edges.push(ProxyEdge {
            id: super::new_id(),
            from: EDGE_LOCAL.to_string(),
            to: EDGE_DIRECT.to_string(),
            enabled: true,
            ..Default::default()
        });
        fr
    }

    /// 图中是否引用了某个节点（边端点、via 或插槽绑定）
    pub fn references_node(&self, node_id: &str) -> bool {
        let cp = &self.chain_proxy;
        cp.edges
            .iter()
            .any(|e| e.from == node_id || e.to == node_id || e.via.iter().any(|v| v == node_id))
            || cp.slots.iter().any(|s| s.bound_node_id == node_id)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("frouter name is required".into());
        }
        Ok(())
    }
}
