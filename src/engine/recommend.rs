use serde::Serialize;

use super::selector::supports_node;
use crate::adapter::AdapterSet;
use crate::domain::{EngineKind, Node};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRecommendation {
    pub recommended_engine: EngineKind,
    pub reason: String,
    /// Xray 能处理的节点数
    pub xray_compatible: usize,
    pub sing_box_only: usize,
    pub total_nodes: usize,
}

/// 根据节点协议分布推荐默认引擎
pub fn recommend_engine(adapters: &AdapterSet, nodes: &[Node]) -> EngineRecommendation {
    let xray = adapters.get(EngineKind::Xray);
    let xray_compatible = nodes
        .iter()
        .filter(|n| xray.as_deref().map(|a| supports_node(a, n)).unwrap_or(false))
        .count();
    let sing_box_only = nodes.iter().filter(|n| n.requires_singbox()).count();
    let total_nodes = nodes.len();

    let (recommended_engine, reason) = if total_nodes == 0 {
        (
            EngineKind::Xray,
            "无节点，推荐使用更成熟稳定的 Xray".to_string(),
        )
    } else if sing_box_only > 0 {
        (
            EngineKind::SingBox,
            format!(
                "存在 {} 个仅 sing-box 支持的节点（如 Hysteria2/TUIC）",
                sing_box_only
            ),
        )
    } else if xray_compatible == total_nodes {
        (
            EngineKind::Xray,
            "所有节点均支持 Xray，推荐使用更成熟稳定的 Xray".to_string(),
        )
    } else {
        (
            EngineKind::SingBox,
            "sing-box 支持更多协议，推荐作为通用选择".to_string(),
        )
    };

    EngineRecommendation {
        recommended_engine,
        reason,
        xray_compatible,
        sing_box_only,
        total_nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeProtocol;

    #[test]
    fn empty_prefers_xray() {
        let rec = recommend_engine(&AdapterSet::defaults(), &[]);
        assert_eq!(rec.recommended_engine, EngineKind::Xray);
        assert_eq!(rec.total_nodes, 0);
    }

    #[test]
    fn tuic_pushes_singbox() {
        let nodes = vec![
            Node::new("a", "h", 1, NodeProtocol::Vless),
            Node::new("b", "h", 2, NodeProtocol::Tuic),
        ];
        let rec = recommend_engine(&AdapterSet::defaults(), &nodes);
        assert_eq!(rec.recommended_engine, EngineKind::SingBox);
        assert_eq!(rec.sing_box_only, 1);
        assert_eq!(rec.xray_compatible, 1);
        assert!(rec.reason.contains("1 个"));

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["recommendedEngine"], "singbox");
        assert_eq!(json["singBoxOnly"], 1);
    }

    #[test]
    fn all_xray_compatible() {
        let nodes = vec![
            Node::new("a", "h", 1, NodeProtocol::Trojan),
            Node::new("b", "h", 2, NodeProtocol::Shadowsocks),
        ];
        let rec = recommend_engine(&AdapterSet::defaults(), &nodes);
        assert_eq!(rec.recommended_engine, EngineKind::Xray);
        assert_eq!(rec.xray_compatible, 2);
    }
}
