//! FRouter 图编译
//!
//! 把用户编辑的链路图化简成三部分：默认出口、按优先级排序的分流规则、
//! 以及节点之间的 detour（前置代理）关系。所有问题一次性收集后整体返回。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::common::VeaError;
use crate::domain::frouter::is_slot;
use crate::domain::{
    EdgeRuleType, FRouter, Node, ProxyEdge, RouteMatchRule, SlotNode, EDGE_BLOCK, EDGE_DIRECT,
    EDGE_LOCAL, SLOT_PREFIX,
};

/// 流量去向
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Node(String),
    Direct,
    Block,
}

impl Action {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Action::Node(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Node(id) => write!(f, "node:{}", id),
            Action::Direct => f.write_str("direct"),
            Action::Block => f.write_str("block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteRule {
    pub edge_id: String,
    pub priority: i32,
    pub matcher: RouteMatchRule,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFRouter {
    pub default: Action,
    /// 已按 priority 降序、edge id 升序排好
    pub rules: Vec<RouteRule>,
    /// node id -> 上游 node id（本节点经由上游拨号）
    pub detour: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl CompiledFRouter {
    /// 实际会用到的节点：默认/规则目标加上 detour 闭包
    pub fn active_node_ids(&self) -> HashSet<String> {
        let mut active = HashSet::new();
        let mut queue = VecDeque::new();

        let targets = std::iter::once(&self.default).chain(self.rules.iter().map(|r| &r.action));
        for id in targets.filter_map(Action::node_id) {
            if active.insert(id.to_string()) {
                queue.push_back(id.to_string());
            }
        }
        while let Some(id) = queue.pop_front() {
            if let Some(up) = self.detour.get(&id) {
                if active.insert(up.clone()) {
                    queue.push_back(up.clone());
                }
            }
        }
        active
    }
}

/// 编译过程的累积状态
struct Ctx<'a> {
    nodes: HashMap<&'a str, &'a Node>,
    slots: HashMap<String, String>,
    detour: BTreeMap<String, String>,
    problems: Vec<String>,
    warnings: Vec<String>,
}

enum Endpoint {
    Resolved(String),
    /// 未绑定的 slot，边被跳过
    Unbound(String),
}

impl<'a> Ctx<'a> {
    fn new(nodes: &'a [Node]) -> Self {
        let mut ctx = Self {
            nodes: HashMap::with_capacity(nodes.len()),
            slots: HashMap::new(),
            detour: BTreeMap::new(),
            problems: Vec::new(),
            warnings: Vec::new(),
        };
        for n in nodes {
            let id = n.id.trim();
            if id.is_empty() {
                ctx.problems.push("node has empty id".into());
                continue;
            }
            if ctx.nodes.insert(id, n).is_some() {
                ctx.problems.push(format!("duplicate node id: {}", id));
            }
        }
        ctx
    }

    fn load_slots(&mut self, slots: &[SlotNode]) {
        for slot in slots {
            let id = slot.id.trim();
            if id.is_empty() {
                self.problems.push("slot has empty id".into());
                continue;
            }
            if !is_slot(id) {
                self.problems
                    .push(format!("slot {}: id must start with {}", id, SLOT_PREFIX));
                continue;
            }
            if self.slots.contains_key(id) {
                self.problems.push(format!("slot {}: duplicated", id));
                continue;
            }
            let bound = slot.bound_node_id.trim().to_string();
            if !bound.is_empty() && !self.nodes.contains_key(bound.as_str()) {
                self.problems
                    .push(format!("slot {}: boundNodeId not found: {}", id, bound));
            }
            self.slots.insert(id.to_string(), bound);
        }
    }

    fn resolve(&self, id: &str) -> Endpoint {
        let id = id.trim();
        if !is_slot(id) {
            return Endpoint::Resolved(id.to_string());
        }
        match self.slots.get(id) {
            Some(bound) if !bound.is_empty() => Endpoint::Resolved(bound.clone()),
            _ => Endpoint::Unbound(format!("slot {} is unbound", id)),
        }
    }

    fn is_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    fn add_detour(&mut self, from: &str, to: &str, edge_id: &str) {
        if from == to {
            self.problems
                .push(format!("edge {}: detour is self-loop: {}", edge_id, from));
            return;
        }
        if !self.is_node(from) {
            self.problems
                .push(format!("edge {}: detour from node not found: {}", edge_id, from));
            return;
        }
        if !self.is_node(to) {
            self.problems
                .push(format!("edge {}: detour to node not found: {}", edge_id, to));
            return;
        }
        match self.detour.get(from) {
            Some(existing) if existing != to => {
                self.problems.push(format!(
                    "node {} has multiple detour upstreams: {} and {}",
                    from, existing, to
                ));
            }
            _ => {
                self.detour.insert(from.to_string(), to.to_string());
            }
        }
    }

    fn detect_cycles(&mut self) {
        // 每个节点至多一个上游，沿链走即可
        let mut done: HashSet<&str> = HashSet::new();
        let mut cycles = Vec::new();
        for start in self.detour.keys() {
            if done.contains(start.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut cur = start.as_str();
            loop {
                if let Some(pos) = path.iter().position(|p| *p == cur) {
                    let mut cycle: Vec<&str> = path[pos..].to_vec();
                    cycle.push(cur);
                    cycles.push(format!("detour cycle: {}", cycle.join(" -> ")));
                    break;
                }
                if done.contains(cur) {
                    break;
                }
                path.push(cur);
                match self.detour.get(cur) {
                    Some(next) => cur = next.as_str(),
                    None => break,
                }
            }
            done.extend(path);
        }
        self.problems.extend(cycles);
    }
}

fn selection_action(ctx: &Ctx<'_>, to: &str) -> Option<Action> {
    match to {
        EDGE_DIRECT => Some(Action::Direct),
        EDGE_BLOCK => Some(Action::Block),
        id if ctx.is_node(id) => Some(Action::Node(id.to_string())),
        _ => None,
    }
}

/// 选择边是否为默认边；规则组合非法时返回错误描述
fn classify_selection(edge: &ProxyEdge) -> Result<bool, String> {
    let to = edge.to.trim();
    if (to == EDGE_DIRECT || to == EDGE_BLOCK) && !edge.via.is_empty() {
        return Err(format!("via is not allowed when to={}", to));
    }
    match edge.rule_type {
        EdgeRuleType::None => {
            if edge.route_rule.as_ref().is_some_and(|r| !r.is_empty()) {
                return Err("ruleType=empty must not carry routeRule".into());
            }
            Ok(true)
        }
        EdgeRuleType::Route => Ok(edge.is_default()),
    }
}

/// 编译 FRouter；失败时返回包含全部问题的 `CompileError`
pub fn compile_frouter(frouter: &FRouter, nodes: &[Node]) -> Result<CompiledFRouter, VeaError> {
    let mut ctx = Ctx::new(nodes);
    ctx.load_slots(&frouter.chain_proxy.slots);

    let mut rules = Vec::new();
    let mut defaults: Vec<(String, Action)> = Vec::new();

    for edge in frouter.chain_proxy.edges.iter().filter(|e| e.enabled) {
        let from = match ctx.resolve(&edge.from) {
            Endpoint::Resolved(id) => id,
            Endpoint::Unbound(why) => {
                ctx.warnings.push(format!("edge {} skipped: {}", edge.id, why));
                continue;
            }
        };
        let to = match ctx.resolve(&edge.to) {
            Endpoint::Resolved(id) => id,
            Endpoint::Unbound(why) => {
                ctx.warnings.push(format!("edge {} skipped: {}", edge.id, why));
                continue;
            }
        };

        if from.is_empty() || to.is_empty() {
            ctx.problems
                .push(format!("edge {} has empty endpoint", edge.id));
            continue;
        }
        if from == to {
            ctx.problems
                .push(format!("edge {} is self-loop: {}", edge.id, from));
            continue;
        }

        if from == EDGE_LOCAL {
            let Some(action) = selection_action(&ctx, &to) else {
                ctx.problems
                    .push(format!("edge {} references missing node", edge.id));
                continue;
            };

            if let Action::Node(target) = &action {
                // to 经由 via[last] ... via[0] 拨出
                let mut chain = vec![target.clone()];
                for hop in edge.via.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
                    match ctx.resolve(hop) {
                        Endpoint::Unbound(why) => ctx
                            .warnings
                            .push(format!("edge {}: via {} skipped: {}", edge.id, hop, why)),
                        Endpoint::Resolved(id)
                            if id == EDGE_DIRECT || id == EDGE_BLOCK || id == EDGE_LOCAL =>
                        {
                            ctx.problems.push(format!(
                                "edge {}: via contains invalid node {}",
                                edge.id, id
                            ))
                        }
                        Endpoint::Resolved(id) => chain.push(id),
                    }
                }
                for pair in chain.windows(2) {
                    ctx.add_detour(&pair[0], &pair[1], &edge.id);
                }
            }

            match classify_selection(edge) {
                Err(why) => ctx.problems.push(format!("edge {}: {}", edge.id, why)),
                Ok(true) => {
                    if edge.priority != 0 {
                        ctx.warnings.push(format!(
                            "edge {} is default; priority forced to 0",
                            edge.id
                        ));
                    }
                    defaults.push((edge.id.clone(), action));
                }
                Ok(false) => rules.push(RouteRule {
                    edge_id: edge.id.clone(),
                    priority: edge.priority,
                    matcher: edge.route_rule.clone().unwrap_or_default(),
                    action,
                }),
            }
            continue;
        }

        // detour 边
        if from == EDGE_DIRECT || from == EDGE_BLOCK {
            ctx.problems.push(format!(
                "edge {}: detour from {} is not allowed",
                edge.id, from
            ));
            continue;
        }
        if to == EDGE_LOCAL {
            ctx.problems
                .push(format!("edge {}: detour to {} is not allowed", edge.id, to));
            continue;
        }
        if to == EDGE_DIRECT || to == EDGE_BLOCK {
            // slot 绑定到 direct/block 时没有 detour 效果
            if !is_slot(edge.from.trim()) {
                ctx.problems
                    .push(format!("edge {}: detour to {} is not allowed", edge.id, to));
            }
            continue;
        }
        if edge.rule_type != EdgeRuleType::None || edge.route_rule.is_some() {
            ctx.problems.push(format!(
                "edge {}: detour edge must not carry a route rule",
                edge.id
            ));
            continue;
        }
        if !edge.via.is_empty() {
            ctx.problems
                .push(format!("edge {}: detour edge must not have via", edge.id));
            continue;
        }
        ctx.add_detour(&from, &to, &edge.id);
    }

    match defaults.len() {
        0 => ctx
            .problems
            .push("missing default edge (local -> ...)".into()),
        1 => {}
        _ => {
            let ids: Vec<&str> = defaults.iter().map(|(id, _)| id.as_str()).collect();
            ctx.problems
                .push(format!("multiple default edges: {}", ids.join(", ")));
        }
    }

    ctx.detect_cycles();

    if !ctx.problems.is_empty() {
        return Err(VeaError::CompileError {
            problems: ctx.problems,
        });
    }

    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.edge_id.cmp(&b.edge_id))
    });

    let default = defaults
        .into_iter()
        .next()
        .map(|(_, a)| a)
        .unwrap_or(Action::Direct);

    Ok(CompiledFRouter {
        default,
        rules,
        detour: ctx.detour,
        warnings: ctx.warnings,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeProtocol;

    fn node(id: &str) -> Node {
        let mut n = Node::new(id, "127.0.0.1", 443, NodeProtocol::Vless);
        n.id = id.to_string();
        n
    }

    fn edge(id: &str, from: &str, to: &str) -> ProxyEdge {
        ProxyEdge {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            enabled: true,
            ..Default::default()
        }
    }

    fn rule_edge(id: &str, to: &str, priority: i32, domains: &[&str]) -> ProxyEdge {
        ProxyEdge {
            priority,
            rule_type: EdgeRuleType::Route,
            route_rule: Some(RouteMatchRule {
                domains: domains.iter().map(|d| d.to_string()).collect(),
                ips: vec![],
            }),
            ..edge(id, EDGE_LOCAL, to)
        }
    }

    fn router(edges: Vec<ProxyEdge>) -> FRouter {
        let mut fr = FRouter::new("t");
        fr.chain_proxy.edges = edges;
        fr
    }

    #[test]
    fn default_and_sorted_rules() {
        let nodes = vec![node("a"), node("b")];
        let fr = router(vec![
            edge("e0", EDGE_LOCAL, "a"),
            rule_edge("e2", "b", 1, &["geosite:netflix"]),
            rule_edge("e1", EDGE_DIRECT, 5, &["geosite:cn"]),
            rule_edge("e3", EDGE_BLOCK, 1, &["ads.example"]),
        ]);
        let c = compile_frouter(&fr, &nodes).unwrap();
        assert_eq!(c.default, Action::Node("a".into()));
        let order: Vec<&str> = c.rules.iter().map(|r| r.edge_id.as_str()).collect();
        assert_eq!(order, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn dangling_edge_is_reported() {
        let fr = router(vec![edge("e1", EDGE_LOCAL, "ghost")]);
        let err = compile_frouter(&fr, &[node("a")]).unwrap_err();
        match err {
            VeaError::CompileError { problems } => {
                assert!(problems.contains(&"edge e1 references missing node".to_string()));
                assert!(problems.iter().any(|p| p.starts_with("missing default edge")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn multiple_defaults_rejected() {
        let fr = router(vec![
            edge("e1", EDGE_LOCAL, EDGE_DIRECT),
            edge("e2", EDGE_LOCAL, "a"),
        ]);
        let err = compile_frouter(&fr, &[node("a")]).unwrap_err();
        assert!(err.to_string().contains("multiple default edges: e1, e2"));
    }

    #[test]
    fn via_builds_detour_chain() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let mut e = edge("e1", EDGE_LOCAL, "a");
        e.via = vec!["b".into(), "c".into()];
        let c = compile_frouter(&router(vec![e]), &nodes).unwrap();
        assert_eq!(c.detour.get("a").map(String::as_str), Some("b"));
        assert_eq!(c.detour.get("b").map(String::as_str), Some("c"));
        let active = c.active_node_ids();
        assert_eq!(active.len(), 3);
    }

    #[test]
    fn detour_cycle_detected() {
        let nodes = vec![node("a"), node("b")];
        let fr = router(vec![
            edge("e0", EDGE_LOCAL, "a"),
            edge("d1", "a", "b"),
            edge("d2", "b", "a"),
        ]);
        let err = compile_frouter(&fr, &nodes).unwrap_err();
        assert!(err.to_string().contains("detour cycle: a -> b -> a"));
    }

    #[test]
    fn conflicting_upstreams_rejected() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let fr = router(vec![
            edge("e0", EDGE_LOCAL, "a"),
            edge("d1", "a", "b"),
            edge("d2", "a", "c"),
        ]);
        let err = compile_frouter(&fr, &nodes).unwrap_err();
        assert!(err.to_string().contains("multiple detour upstreams"));
    }

    #[test]
    fn unbound_slot_skipped_with_warning() {
        let nodes = vec![node("a")];
        let mut fr = router(vec![
            edge("e0", EDGE_LOCAL, "a"),
            rule_edge("e1", "slot-1", 3, &["example.com"]),
        ]);
        fr.chain_proxy.slots.push(SlotNode {
            id: "slot-1".into(),
            name: "备用".into(),
            bound_node_id: String::new(),
        });
        let c = compile_frouter(&fr, &nodes).unwrap();
        assert!(c.rules.is_empty());
        assert_eq!(c.warnings.len(), 1);
    }

    #[test]
    fn bound_slot_resolves_to_node() {
        let nodes = vec![node("a")];
        let mut fr = router(vec![edge("e0", EDGE_LOCAL, "slot-main")]);
        fr.chain_proxy.slots.push(SlotNode {
            id: "slot-main".into(),
            name: "主".into(),
            bound_node_id: "a".into(),
        });
        let c = compile_frouter(&fr, &nodes).unwrap();
        assert_eq!(c.default, Action::Node("a".into()));
    }

    #[test]
    fn disabled_edges_ignored() {
        let mut off = edge("e1", EDGE_LOCAL, "ghost");
        off.enabled = false;
        let fr = router(vec![off, edge("e0", EDGE_LOCAL, EDGE_DIRECT)]);
        let c = compile_frouter(&fr, &[]).unwrap();
        assert_eq!(c.default, Action::Direct);
        assert!(c.active_node_ids().is_empty());
    }
}
