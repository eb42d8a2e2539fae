//! 内存仓储
//!
//! 单个 RwLock 保护整份状态；每次变更后在释放锁之后发布事件。

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::events::{EventBus, EventKind};
use super::{
    ComponentRepository, ConfigRepository, FRouterRepository, GeoRepository, NodeRepository,
    SettingsRepository,
};
use crate::common::{Result, VeaError};
use crate::domain::{
    new_id, ComponentKind, Config, CoreComponent, FRouter, GeoResource, InstallStatus, Node,
    ProxyConfig, ServiceState, SystemProxySettings, SCHEMA_VERSION,
};

pub struct MemoryStore {
    state: RwLock<ServiceState>,
    events: EventBus,
}

impl MemoryStore {
    pub fn new(events: EventBus) -> Self {
        Self::from_state(ServiceState::default(), events)
    }

    pub fn from_state(state: ServiceState, events: EventBus) -> Self {
        Self {
            state: RwLock::new(state),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// 当前状态快照（带当前 schemaVersion 与生成时间）
    pub async fn snapshot(&self) -> ServiceState {
        let mut snap = self.state.read().await.clone();
        snap.schema_version = SCHEMA_VERSION.to_string();
        snap.generated_at = Utc::now();
        snap
    }

    /// 用加载的快照整体替换（不发布事件）
    pub async fn restore(&self, state: ServiceState) {
        *self.state.write().await = state;
    }

    fn publish(&self, kind: EventKind, id: &str) {
        self.events.publish(kind, id);
    }
}

fn not_found(what: &str, id: &str) -> VeaError {
    VeaError::NotFound(format!("{} {}", what, id))
}

fn ensure_id(id: &mut String) {
    if id.trim().is_empty() {
        *id = new_id();
    }
}

// ─── 节点 ──────────────────────────────────────────────────────────

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn list(&self) -> Vec<Node> {
        self.state.read().await.nodes.clone()
    }

    async fn get(&self, id: &str) -> Result<Node> {
        self.state
            .read()
            .await
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| not_found("node", id))
    }

    async fn create(&self, mut node: Node) -> Result<Node> {
        node.validate().map_err(VeaError::InvalidInput)?;
        ensure_id(&mut node.id);
        let now = Utc::now();
        node.created_at = now;
        node.updated_at = now;
        {
            let mut st = self.state.write().await;
            if st.nodes.iter().any(|n| n.id == node.id) {
                return Err(VeaError::invalid(format!("node {} already exists", node.id)));
            }
            st.nodes.push(node.clone());
        }
        self.publish(EventKind::NodeCreated, &node.id);
        Ok(node)
    }

    async fn update(&self, id: &str, mut node: Node) -> Result<Node> {
        node.validate().map_err(VeaError::InvalidInput)?;
        {
            let mut st = self.state.write().await;
            let slot = st
                .nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| not_found("node", id))?;
            node.id = id.to_string();
            node.created_at = slot.created_at;
            node.updated_at = Utc::now();
            *slot = node.clone();
        }
        self.publish(EventKind::NodeUpdated, id);
        Ok(node)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut st = self.state.write().await;
            if let Some(fr) = st.frouters.iter().find(|f| f.references_node(id)) {
                return Err(VeaError::invalid(format!(
                    "node {} is referenced by frouter {}",
                    id, fr.name
                )));
            }
            let before = st.nodes.len();
            st.nodes.retain(|n| n.id != id);
            if st.nodes.len() == before {
                return Err(not_found("node", id));
            }
        }
        self.publish(EventKind::NodeDeleted, id);
        Ok(())
    }
}

// ─── FRouter ───────────────────────────────────────────────────────

#[async_trait]
impl FRouterRepository for MemoryStore {
    async fn list(&self) -> Vec<FRouter> {
        self.state.read().await.frouters.clone()
    }

    async fn get(&self, id: &str) -> Result<FRouter> {
        self.state
            .read()
            .await
            .frouters
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or_else(|| not_found("frouter", id))
    }

    async fn create(&self, mut frouter: FRouter) -> Result<FRouter> {
        frouter.validate().map_err(VeaError::InvalidInput)?;
        ensure_id(&mut frouter.id);
        let now = Utc::now();
        frouter.created_at = now;
        frouter.updated_at = now;
        {
            let mut st = self.state.write().await;
            if st.frouters.iter().any(|f| f.id == frouter.id) {
                return Err(VeaError::invalid(format!(
                    "frouter {} already exists",
                    frouter.id
                )));
            }
            st.frouters.push(frouter.clone());
        }
        self.publish(EventKind::FRouterCreated, &frouter.id);
        Ok(frouter)
    }

    async fn update(&self, id: &str, mut frouter: FRouter) -> Result<FRouter> {
        frouter.validate().map_err(VeaError::InvalidInput)?;
        {
            let mut st = self.state.write().await;
            let slot = st
                .frouters
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| not_found("frouter", id))?;
            frouter.id = id.to_string();
            frouter.created_at = slot.created_at;
            frouter.updated_at = Utc::now();
            *slot = frouter.clone();
        }
        self.publish(EventKind::FRouterUpdated, id);
        Ok(frouter)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut st = self.state.write().await;
            let before = st.frouters.len();
            st.frouters.retain(|f| f.id != id);
            if st.frouters.len() == before {
                return Err(not_found("frouter", id));
            }
        }
        self.publish(EventKind::FRouterDeleted, id);
        Ok(())
    }
}

// ─── 组件 ──────────────────────────────────────────────────────────

#[async_trait]
impl ComponentRepository for MemoryStore {
    async fn list(&self) -> Vec<CoreComponent> {
        self.state.read().await.components.clone()
    }

    async fn get(&self, id: &str) -> Result<CoreComponent> {
        self.state
            .read()
            .await
            .components
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found("component", id))
    }

    async fn get_by_kind(&self, kind: ComponentKind) -> Result<CoreComponent> {
        self.state
            .read()
            .await
            .components
            .iter()
            .find(|c| c.kind == kind)
            .cloned()
            .ok_or_else(|| not_found("component", kind.as_str()))
    }

    async fn create(&self, mut component: CoreComponent) -> Result<CoreComponent> {
        ensure_id(&mut component.id);
        if component.name.trim().is_empty() {
            component.name = component.kind.as_str().to_string();
        }
        {
            let mut st = self.state.write().await;
            // 内核组件按 kind 唯一
            if component.kind != ComponentKind::Generic {
                if let Some(existing) = st.components.iter().find(|c| c.kind == component.kind) {
                    return Ok(existing.clone());
                }
            }
            let now = Utc::now();
            component.created_at = now;
            component.updated_at = now;
            st.components.push(component.clone());
        }
        self.publish(EventKind::ComponentCreated, &component.id);
        Ok(component)
    }

    async fn update(&self, id: &str, mut component: CoreComponent) -> Result<CoreComponent> {
        {
            let mut st = self.state.write().await;
            let slot = st
                .components
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| not_found("component", id))?;
            component.id = id.to_string();
            component.created_at = slot.created_at;
            component.updated_at = Utc::now();
            *slot = component.clone();
        }
        self.publish(EventKind::ComponentUpdated, id);
        Ok(component)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut st = self.state.write().await;
            let before = st.components.len();
            st.components.retain(|c| c.id != id);
            if st.components.len() == before {
                return Err(not_found("component", id));
            }
        }
        self.publish(EventKind::ComponentDeleted, id);
        Ok(())
    }

    async fn update_install_status(
        &self,
        id: &str,
        status: InstallStatus,
        progress: u8,
        message: &str,
    ) -> Result<()> {
        {
            let mut st = self.state.write().await;
            let comp = st
                .components
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| not_found("component", id))?;
            comp.install_status = status;
            comp.install_progress = progress.min(100);
            comp.install_message = message.to_string();
            if status == InstallStatus::Error {
                comp.last_sync_error = message.to_string();
            }
            comp.updated_at = Utc::now();
        }
        self.publish(EventKind::ComponentUpdated, id);
        Ok(())
    }

    async fn set_installed(
        &self,
        id: &str,
        install_dir: &str,
        version: &str,
        checksum: &str,
    ) -> Result<()> {
        {
            let mut st = self.state.write().await;
            let comp = st
                .components
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| not_found("component", id))?;
            let now = Utc::now();
            comp.install_dir = install_dir.to_string();
            comp.last_version = version.to_string();
            comp.checksum = checksum.to_string();
            comp.last_installed_at = Some(now);
            comp.last_sync_error.clear();
            comp.updated_at = now;
        }
        self.publish(EventKind::ComponentUpdated, id);
        Ok(())
    }
}

// ─── 设置 ──────────────────────────────────────────────────────────

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn proxy_config(&self) -> ProxyConfig {
        self.state.read().await.proxy_config.clone()
    }

    async fn update_proxy_config(&self, mut cfg: ProxyConfig) -> Result<ProxyConfig> {
        cfg.updated_at = Some(Utc::now());
        self.state.write().await.proxy_config = cfg.clone();
        self.publish(EventKind::ProxyConfigChanged, "");
        Ok(cfg)
    }

    async fn system_proxy(&self) -> SystemProxySettings {
        self.state.read().await.system_proxy.clone()
    }

    async fn update_system_proxy(
        &self,
        mut settings: SystemProxySettings,
    ) -> Result<SystemProxySettings> {
        settings.updated_at = Some(Utc::now());
        self.state.write().await.system_proxy = settings.clone();
        self.publish(EventKind::SystemProxyChanged, "");
        Ok(settings)
    }

    async fn frontend(&self) -> Map<String, Value> {
        self.state.read().await.frontend_settings.clone()
    }

    async fn update_frontend(&self, settings: Map<String, Value>) -> Result<Map<String, Value>> {
        self.state.write().await.frontend_settings = settings.clone();
        self.publish(EventKind::FrontendChanged, "");
        Ok(settings)
    }
}

// ─── 订阅 / Geo ────────────────────────────────────────────────────

#[async_trait]
impl ConfigRepository for MemoryStore {
    async fn list(&self) -> Vec<Config> {
        self.state.read().await.configs.clone()
    }

    async fn get(&self, id: &str) -> Result<Config> {
        self.state
            .read()
            .await
            .configs
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found("config", id))
    }

    async fn create(&self, mut config: Config) -> Result<Config> {
        if config.name.trim().is_empty() {
            return Err(VeaError::invalid("config name is required"));
        }
        ensure_id(&mut config.id);
        self.state.write().await.configs.push(config.clone());
        self.publish(EventKind::ConfigCreated, &config.id);
        Ok(config)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut st = self.state.write().await;
            let before = st.configs.len();
            st.configs.retain(|c| c.id != id);
            if st.configs.len() == before {
                return Err(not_found("config", id));
            }
            // 订阅拥有的节点随订阅一起删除，但仍被路由引用的保留
            let referenced: Vec<String> = st
                .nodes
                .iter()
                .filter(|n| n.source_config_id == id)
                .filter(|n| st.frouters.iter().any(|f| f.references_node(&n.id)))
                .map(|n| n.id.clone())
                .collect();
            st.nodes
                .retain(|n| n.source_config_id != id || referenced.contains(&n.id));
        }
        self.publish(EventKind::ConfigDeleted, id);
        Ok(())
    }
}

#[async_trait]
impl GeoRepository for MemoryStore {
    async fn list(&self) -> Vec<GeoResource> {
        self.state.read().await.geo_resources.clone()
    }

    async fn get(&self, id: &str) -> Result<GeoResource> {
        self.state
            .read()
            .await
            .geo_resources
            .iter()
            .find(|g| g.id == id)
            .cloned()
            .ok_or_else(|| not_found("geo resource", id))
    }

    async fn create(&self, mut resource: GeoResource) -> Result<GeoResource> {
        if resource.name.trim().is_empty() {
            return Err(VeaError::invalid("geo resource name is required"));
        }
        ensure_id(&mut resource.id);
        self.state.write().await.geo_resources.push(resource.clone());
        self.publish(EventKind::GeoCreated, &resource.id);
        Ok(resource)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        {
            let mut st = self.state.write().await;
            let before = st.geo_resources.len();
            st.geo_resources.retain(|g| g.id != id);
            if st.geo_resources.len() == before {
                return Err(not_found("geo resource", id));
            }
        }
        self.publish(EventKind::GeoDeleted, id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeProtocol, ProxyEdge, EDGE_LOCAL};

    fn store() -> MemoryStore {
        MemoryStore::new(EventBus::default())
    }

    #[tokio::test]
    async fn node_crud_publishes_events() {
        let s = store();
        let mut rx = s.events().subscribe();

        let node = NodeRepository::create(
            &s,
            Node::new("hk", "1.1.1.1", 443, NodeProtocol::Trojan),
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::NodeCreated);

        let mut changed = node.clone();
        changed.port = 8443;
        let updated = NodeRepository::update(&s, &node.id, changed).await.unwrap();
        assert_eq!(updated.port, 8443);
        assert_eq!(updated.created_at, node.created_at);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::NodeUpdated);

        NodeRepository::delete(&s, &node.id).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::NodeDeleted);
        assert!(NodeRepository::get(&s, &node.id).await.is_err());
    }

    #[tokio::test]
    async fn referenced_node_cannot_be_deleted() {
        let s = store();
        let node = NodeRepository::create(&s, Node::new("a", "h", 1, NodeProtocol::Vless))
            .await
            .unwrap();
        let mut fr = FRouter::new("fr");
        fr.chain_proxy.edges.push(ProxyEdge {
            id: "e1".into(),
            from: EDGE_LOCAL.into(),
            to: node.id.clone(),
            enabled: true,
            ..Default::default()
        });
        FRouterRepository::create(&s, fr).await.unwrap();

        let err = NodeRepository::delete(&s, &node.id).await.unwrap_err();
        assert!(matches!(err, VeaError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn invalid_node_rejected() {
        let s = store();
        let err = NodeRepository::create(&s, Node::new("a", "h", 0, NodeProtocol::Vless))
            .await
            .unwrap_err();
        assert!(matches!(err, VeaError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn component_unique_per_kind_and_install_marks() {
        let s = store();
        let a = ComponentRepository::create(&s, CoreComponent::new("xray", ComponentKind::Xray))
            .await
            .unwrap();
        let b = ComponentRepository::create(&s, CoreComponent::new("xray2", ComponentKind::Xray))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);

        s.set_installed(&a.id, "/opt/xray", "v1.8.0", "abc")
            .await
            .unwrap();
        let c = s.get_by_kind(ComponentKind::Xray).await.unwrap();
        assert!(c.is_installed());
        assert_eq!(c.last_version, "v1.8.0");
    }

    #[tokio::test]
    async fn snapshot_carries_current_schema() {
        let s = store();
        s.update_frontend(serde_json::json!({"k": 1}).as_object().unwrap().clone())
            .await
            .unwrap();
        let snap = s.snapshot().await;
        assert_eq!(snap.schema_version, SCHEMA_VERSION);
        assert_eq!(snap.frontend_settings["k"], 1);
    }
}
