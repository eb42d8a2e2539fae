//! FRouter → RuntimePlan 编译

pub mod graph;
pub mod plan;

use chrono::Utc;

use crate::common::Result;
use crate::domain::{EngineKind, FRouter, Node, ProxyConfig};

pub use graph::{compile_frouter, Action, CompiledFRouter, RouteRule};
pub use plan::{Purpose, RuntimePlan};

/// Supervisor 通过该 trait 调用编译器，测试可替换
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        purpose: Purpose,
        engine: EngineKind,
        cfg: &ProxyConfig,
        frouter: &FRouter,
        nodes: &[Node],
    ) -> Result<RuntimePlan>;
}

/// 默认实现：图编译 + 过滤出活跃节点
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphCompiler;

impl Compiler for GraphCompiler {
    fn compile(
        &self,
        purpose: Purpose,
        engine: EngineKind,
        cfg: &ProxyConfig,
        frouter: &FRouter,
        nodes: &[Node],
    ) -> Result<RuntimePlan> {
        let compiled = compile_frouter(frouter, nodes)?;
        let active = compiled.active_node_ids();
        let plan_nodes: Vec<Node> = nodes
            .iter()
            .filter(|n| active.contains(&n.id))
            .cloned()
            .collect();
        let rule_set_tags = plan::rule_set_tags(&compiled);

        Ok(RuntimePlan {
            purpose,
            engine,
            proxy_config: cfg.clone(),
            frouter_id: frouter.id.clone(),
            frouter_name: frouter.name.clone(),
            nodes: plan_nodes,
            compiled,
            rule_set_tags,
            created_at: Utc::now(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EdgeRuleType, NodeProtocol, ProxyEdge, RouteMatchRule, EDGE_LOCAL};

    fn sample() -> (FRouter, Vec<Node>) {
        let mut a = Node::new("a", "1.1.1.1", 443, NodeProtocol::Vless);
        a.id = "aaaaaaaa-1".into();
        let mut b = Node::new("b", "2.2.2.2", 443, NodeProtocol::Trojan);
        b.id = "bbbbbbbb-2".into();
        let mut unused = Node::new("c", "3.3.3.3", 443, NodeProtocol::Vmess);
        unused.id = "cccccccc-3".into();

        let mut fr = FRouter::new("fr");
        fr.id = "fr1".into();
        fr.chain_proxy.edges = vec![
            ProxyEdge {
                id: "e0".into(),
                from: EDGE_LOCAL.into(),
                to: a.id.clone(),
                enabled: true,
                ..Default::default()
            },
            ProxyEdge {
                id: "e1".into(),
                from: EDGE_LOCAL.into(),
                to: b.id.clone(),
                enabled: true,
                priority: 10,
                rule_type: EdgeRuleType::Route,
                route_rule: Some(RouteMatchRule {
                    domains: vec!["geosite:netflix".into()],
                    ips: vec!["geoip:us".into(), "geoip:private".into()],
                }),
                ..Default::default()
            },
        ];
        (fr, vec![a, b, unused])
    }

    #[test]
    fn plan_keeps_only_active_nodes() {
        let (fr, nodes) = sample();
        let cfg = ProxyConfig::default();
        let plan = GraphCompiler
            .compile(Purpose::Proxy, EngineKind::SingBox, &cfg, &fr, &nodes)
            .unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert!(plan.node("cccccccc-3").is_none());
        assert_eq!(plan.rule_set_tags, vec!["geoip-us", "geosite-netflix"]);
    }

    #[test]
    fn explain_lists_rules() {
        let (fr, nodes) = sample();
        let mut cfg = ProxyConfig::default();
        cfg.inbound_port = 1080;
        let plan = GraphCompiler
            .compile(Purpose::Proxy, EngineKind::Xray, &cfg, &fr, &nodes)
            .unwrap();
        let text = plan.explain();
        assert!(text.contains("purpose=proxy"));
        assert!(text.contains("engine=xray"));
        assert!(text.contains("frouter=fr1"));
        assert!(text.contains("inboundPort=1080"));
        assert!(text.contains("default=node:aaaaaaaa-1"));
        assert!(text.contains("rule[0] edge=e1 priority=10 -> node:bbbbbbbb-2"));
    }
}
