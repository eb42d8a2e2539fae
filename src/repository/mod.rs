//! 仓储接口
//!
//! Supervisor 与 Facade 只依赖这里的 trait；默认实现是带事件总线的内存存储。

pub mod events;
pub mod memory;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::common::Result;
use crate::domain::{
    ComponentKind, Config, CoreComponent, FRouter, GeoResource, InstallStatus, Node, ProxyConfig,
    SystemProxySettings,
};

pub use events::{Event, EventBus, EventKind};
pub use memory::MemoryStore;

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn list(&self) -> Vec<Node>;
    async fn get(&self, id: &str) -> Result<Node>;
    async fn create(&self, node: Node) -> Result<Node>;
    async fn update(&self, id: &str, node: Node) -> Result<Node>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait FRouterRepository: Send + Sync {
    async fn list(&self) -> Vec<FRouter>;
    async fn get(&self, id: &str) -> Result<FRouter>;
    async fn create(&self, frouter: FRouter) -> Result<FRouter>;
    async fn update(&self, id: &str, frouter: FRouter) -> Result<FRouter>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ComponentRepository: Send + Sync {
    async fn list(&self) -> Vec<CoreComponent>;
    async fn get(&self, id: &str) -> Result<CoreComponent>;
    async fn get_by_kind(&self, kind: ComponentKind) -> Result<CoreComponent>;
    async fn create(&self, component: CoreComponent) -> Result<CoreComponent>;
    async fn update(&self, id: &str, component: CoreComponent) -> Result<CoreComponent>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn update_install_status(
        &self,
        id: &str,
        status: InstallStatus,
        progress: u8,
        message: &str,
    ) -> Result<()>;
    async fn set_installed(
        &self,
        id: &str,
        install_dir: &str,
        version: &str,
        checksum: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn proxy_config(&self) -> ProxyConfig;
    async fn update_proxy_config(&self, cfg: ProxyConfig) -> Result<ProxyConfig>;
    async fn system_proxy(&self) -> SystemProxySettings;
    async fn update_system_proxy(&self, settings: SystemProxySettings)
        -> Result<SystemProxySettings>;
    async fn frontend(&self) -> Map<String, Value>;
    async fn update_frontend(&self, settings: Map<String, Value>) -> Result<Map<String, Value>>;
}

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn list(&self) -> Vec<Config>;
    async fn get(&self, id: &str) -> Result<Config>;
    async fn create(&self, config: Config) -> Result<Config>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait GeoRepository: Send + Sync {
    async fn list(&self) -> Vec<GeoResource>;
    async fn get(&self, id: &str) -> Result<GeoResource>;
    async fn create(&self, resource: GeoResource) -> Result<GeoResource>;
    async fn delete(&self, id: &str) -> Result<()>;
}
