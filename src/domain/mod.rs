//! 领域模型
//!
//! 所有实体以 camelCase JSON 持久化，字段命名与前端 SDK 保持一致。

pub mod component;
pub mod frouter;
pub mod node;
pub mod proxy;
pub mod state;

pub use component::{ComponentKind, CoreComponent, InstallStatus};
pub use frouter::{
    ChainProxySettings, EdgeRuleType, FRouter, GraphPosition, ProxyEdge, RouteMatchRule, SlotNode,
    EDGE_BLOCK, EDGE_DIRECT, EDGE_LOCAL, SLOT_PREFIX,
};
pub use node::{Node, NodeProtocol, NodeSecurity, NodeTls, NodeTransport};
pub use proxy::{
    DnsConfig, EngineKind, InboundAuth, InboundConfig, InboundMode, LogConfig, ProxyConfig,
    TunSettings,
};
pub use state::{
    Config, GeoResource, GeoResourceType, ServiceState, SystemProxySettings,
    LEGACY_SCHEMA_VERSION, SCHEMA_VERSION,
};

/// 生成新实体 ID
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
