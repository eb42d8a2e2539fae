//! 引擎选择与推荐

pub mod recommend;
pub mod selector;

use std::collections::HashSet;

use serde::Serialize;

use crate::adapter::AdapterSet;
use crate::config::FrontendSettingsView;
use crate::domain::{CoreComponent, EngineKind, Node};

pub use recommend::{recommend_engine, EngineRecommendation};
pub use selector::{select_engine, EngineRequest};

/// 已安装（有安装目录且记录过安装时间）的引擎
pub fn installed_engines(components: &[CoreComponent]) -> HashSet<EngineKind> {
    components
        .iter()
        .filter(|c| c.is_installed())
        .filter_map(|c| c.kind.engine())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub xray_installed: bool,
    pub singbox_installed: bool,
    pub clash_installed: bool,
    pub default_engine: EngineKind,
    pub recommendation: EngineRecommendation,
}

/// 前端设置了具体默认引擎时用它，否则按节点推荐
pub fn effective_default_engine(
    frontend: &FrontendSettingsView,
    recommendation: &EngineRecommendation,
) -> EngineKind {
    frontend
        .default_engine
        .unwrap_or(recommendation.recommended_engine)
}

pub fn engine_status(
    adapters: &AdapterSet,
    components: &[CoreComponent],
    frontend: &FrontendSettingsView,
    nodes: &[Node],
) -> EngineStatus {
    let installed = installed_engines(components);
    let recommendation = recommend_engine(adapters, nodes);
    EngineStatus {
        xray_installed: installed.contains(&EngineKind::Xray),
        singbox_installed: installed.contains(&EngineKind::SingBox),
        clash_installed: installed.contains(&EngineKind::Clash),
        default_engine: effective_default_engine(frontend, &recommendation),
        recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComponentKind, NodeProtocol};
    use chrono::Utc;

    #[test]
    fn status_reflects_components_and_frontend() {
        let mut xray = CoreComponent::new("xray", ComponentKind::Xray);
        xray.install_dir = "/a/core/xray".into();
        xray.last_installed_at = Some(Utc::now());
        let singbox = CoreComponent::new("sing-box", ComponentKind::Singbox);

        let nodes = vec![Node::new("n", "h", 1, NodeProtocol::Vless)];
        let status = engine_status(
            &AdapterSet::defaults(),
            &[xray, singbox],
            &FrontendSettingsView::default(),
            &nodes,
        );
        assert!(status.xray_installed);
        assert!(!status.singbox_installed);
        assert_eq!(status.default_engine, EngineKind::Xray);

        let frontend = FrontendSettingsView {
            default_engine: Some(EngineKind::Clash),
            proxy_port: None,
        };
        let status = engine_status(&AdapterSet::defaults(), &[], &frontend, &nodes);
        assert_eq!(status.default_engine, EngineKind::Clash);
    }
}
