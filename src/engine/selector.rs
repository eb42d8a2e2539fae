//! 为一次启动挑选内核
//!
//! 纯函数：只读适配器能力与"已安装"集合，不安装也不启动任何东西。

use std::collections::HashSet;

use tracing::debug;

use crate::adapter::{AdapterSet, CoreAdapter};
use crate::common::{Result, VeaError};
use crate::compiler::compile_frouter;
use crate::domain::{EngineKind, FRouter, InboundMode, Node};

/// 一次选择的全部输入
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    pub mode: InboundMode,
    /// Auto 表示不指定
    pub preferred: EngineKind,
    pub frouter: &'a FRouter,
    pub nodes: &'a [Node],
    pub installed: &'a HashSet<EngineKind>,
}

/// 按顺序应用规则，首个命中者胜出：
///
/// 1. 链路中有仅 sing-box 支持的节点，必须用 sing-box
/// 2. TUN 入站且偏好引擎支持 TUN 并已安装
/// 3. 偏好引擎支持入站与全部协议并已安装
/// 4. 默认顺序 sing-box、xray、clash 中首个已安装且可用者
///
/// 都不满足时，若存在能力上可用但未安装的引擎，返回 `EngineNotInstalled`
/// 交给调用方安装后重试；否则返回 `NoCompatibleEngine`。
pub fn select_engine(adapters: &AdapterSet, req: &EngineRequest<'_>) -> Result<EngineKind> {
    let compiled = compile_frouter(req.frouter, req.nodes)?;
    let active_ids = compiled.active_node_ids();
    let active: Vec<&Node> = req
        .nodes
        .iter()
        .filter(|n| active_ids.contains(&n.id))
        .collect();

    let installed = |kind: EngineKind| req.installed.contains(&kind);
    let fits = |kind: EngineKind| {
        adapters
            .get(kind)
            .map(|a| supports_all(a.as_ref(), req.mode, &active))
            .unwrap_or(false)
    };

    // 1
    if active.iter().any(|n| n.requires_singbox()) {
        if !fits(EngineKind::SingBox) {
            return Err(VeaError::NoCompatibleEngine {
                reason: "install engine sing-box to use this configuration".into(),
            });
        }
        if !installed(EngineKind::SingBox) {
            return Err(VeaError::EngineNotInstalled {
                engine: EngineKind::SingBox,
            });
        }
        debug!(engine = %EngineKind::SingBox, "engine required by node protocol");
        return Ok(EngineKind::SingBox);
    }

    let preferred = (!req.preferred.is_auto()).then_some(req.preferred);

    // 2
    if let Some(pref) = preferred.filter(|_| req.mode.is_tun()) {
        let tun_capable = adapters
            .get(pref)
            .map(|a| a.supports_inbound(InboundMode::Tun))
            .unwrap_or(false);
        if tun_capable && installed(pref) {
            return Ok(pref);
        }
    }

    // 3
    if let Some(pref) = preferred {
        if fits(pref) && installed(pref) {
            return Ok(pref);
        }
    }

    // 4
    if let Some(kind) = EngineKind::CONCRETE
        .into_iter()
        .find(|k| installed(*k) && fits(*k))
    {
        debug!(engine = %kind, "engine picked by default order");
        return Ok(kind);
    }

    let wanted = preferred
        .filter(|p| fits(*p))
        .or_else(|| EngineKind::CONCRETE.into_iter().find(|k| fits(*k)));
    match wanted {
        Some(engine) => Err(VeaError::EngineNotInstalled { engine }),
        None => Err(VeaError::NoCompatibleEngine {
            reason: format!(
                "no engine supports inbound {} with the protocols in this frouter",
                req.mode
            ),
        }),
    }
}

fn supports_all(adapter: &dyn CoreAdapter, mode: InboundMode, nodes: &[&Node]) -> bool {
    adapter.supports_inbound(mode) && nodes.iter().all(|n| supports_node(adapter, n))
}

/// 仅 sing-box 支持的节点只能交给 sing-box
pub(crate) fn supports_node(adapter: &dyn CoreAdapter, node: &Node) -> bool {
    if node.requires_singbox() && adapter.kind() != EngineKind::SingBox {
        return false;
    }
    adapter.supports_protocol(node.protocol)
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::VeaErrorKind;
    use crate::domain::{NodeProtocol, ProxyEdge, EDGE_LOCAL};

    fn router_to(node: &Node) -> FRouter {
        let mut fr = FRouter::new("fr");
        fr.chain_proxy.edges = vec![ProxyEdge {
            id: "e0".into(),
            from: EDGE_LOCAL.into(),
            to: node.id.clone(),
            enabled: true,
            ..Default::default()
        }];
        fr
    }

    fn installed(kinds: &[EngineKind]) -> HashSet<EngineKind> {
        kinds.iter().copied().collect()
    }

    fn select(
        mode: InboundMode,
        preferred: EngineKind,
        node: &Node,
        inst: &[EngineKind],
    ) -> Result<EngineKind> {
        let fr = router_to(node);
        let nodes = vec![node.clone()];
        let inst = installed(inst);
        select_engine(
            &AdapterSet::defaults(),
            &EngineRequest {
                mode,
                preferred,
                frouter: &fr,
                nodes: &nodes,
                installed: &inst,
            },
        )
    }

    #[test]
    fn hysteria2_forces_singbox() {
        let node = Node::new("hy", "h", 443, NodeProtocol::Hysteria2);
        let all = [EngineKind::Xray, EngineKind::SingBox, EngineKind::Clash];
        assert_eq!(
            select(InboundMode::Socks, EngineKind::Xray, &node, &all).unwrap(),
            EngineKind::SingBox
        );

        let err = select(InboundMode::Socks, EngineKind::Xray, &node, &[EngineKind::Xray])
            .unwrap_err();
        assert!(matches!(
            err,
            VeaError::EngineNotInstalled {
                engine: EngineKind::SingBox
            }
        ));
    }

    #[test]
    fn preference_wins_when_installed() {
        let node = Node::new("v", "h", 443, NodeProtocol::Vless);
        let all = [EngineKind::Xray, EngineKind::SingBox];
        assert_eq!(
            select(InboundMode::Socks, EngineKind::Xray, &node, &all).unwrap(),
            EngineKind::Xray
        );
    }

    #[test]
    fn tun_skips_xray_preference() {
        let node = Node::new("v", "h", 443, NodeProtocol::Vless);
        let all = [EngineKind::Xray, EngineKind::SingBox];
        assert_eq!(
            select(InboundMode::Tun, EngineKind::Xray, &node, &all).unwrap(),
            EngineKind::SingBox
        );
        assert_eq!(
            select(InboundMode::Tun, EngineKind::Clash, &node, &[EngineKind::Clash]).unwrap(),
            EngineKind::Clash
        );
    }

    #[test]
    fn auto_uses_default_order() {
        let node = Node::new("v", "h", 443, NodeProtocol::Vmess);
        assert_eq!(
            select(InboundMode::Mixed, EngineKind::Auto, &node, &[EngineKind::Xray, EngineKind::SingBox]).unwrap(),
            EngineKind::SingBox
        );
        assert_eq!(
            select(InboundMode::Mixed, EngineKind::Auto, &node, &[EngineKind::Clash, EngineKind::Xray]).unwrap(),
            EngineKind::Xray
        );
    }

    #[test]
    fn uninstalled_preference_asks_for_install() {
        let node = Node::new("v", "h", 443, NodeProtocol::Vless);
        let err = select(InboundMode::Socks, EngineKind::Xray, &node, &[]).unwrap_err();
        assert!(matches!(
            err,
            VeaError::EngineNotInstalled {
                engine: EngineKind::Xray
            }
        ));
    }

    #[test]
    fn nothing_capable_is_no_compatible_engine() {
        let node = Node::new("t", "h", 443, NodeProtocol::Tuic);
        let fr = router_to(&node);
        let nodes = vec![node];
        let inst = installed(&[EngineKind::Xray]);
        let adapters = AdapterSet::empty().with(std::sync::Arc::new(crate::adapter::xray::XrayAdapter));
        let err = select_engine(
            &adapters,
            &EngineRequest {
                mode: InboundMode::Socks,
                preferred: EngineKind::Auto,
                frouter: &fr,
                nodes: &nodes,
                installed: &inst,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), VeaErrorKind::NoCompatibleEngine);
    }

    #[test]
    fn broken_frouter_is_compile_error() {
        let node = Node::new("v", "h", 443, NodeProtocol::Vless);
        let mut fr = router_to(&node);
        fr.chain_proxy.edges[0].to = "missing".into();
        let nodes = vec![node];
        let inst = installed(&[EngineKind::Xray]);
        let err = select_engine(
            &AdapterSet::defaults(),
            &EngineRequest {
                mode: InboundMode::Socks,
                preferred: EngineKind::Auto,
                frouter: &fr,
                nodes: &nodes,
                installed: &inst,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), VeaErrorKind::CompileError);
    }
}
