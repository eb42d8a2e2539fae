//! 仓储变更事件总线

use std::fmt;

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FRouterCreated,
    FRouterUpdated,
    FRouterDeleted,
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    ConfigCreated,
    ConfigUpdated,
    ConfigDeleted,
    GeoCreated,
    GeoUpdated,
    GeoDeleted,
    ComponentCreated,
    ComponentUpdated,
    ComponentDeleted,
    SystemProxyChanged,
    ProxyConfigChanged,
    FrontendChanged,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::FRouterCreated => "frouter.created",
            EventKind::FRouterUpdated => "frouter.updated",
            EventKind::FRouterDeleted => "frouter.deleted",
            EventKind::NodeCreated => "node.created",
            EventKind::NodeUpdated => "node.updated",
            EventKind::NodeDeleted => "node.deleted",
            EventKind::ConfigCreated => "config.created",
            EventKind::ConfigUpdated => "config.updated",
            EventKind::ConfigDeleted => "config.deleted",
            EventKind::GeoCreated => "geo.created",
            EventKind::GeoUpdated => "geo.updated",
            EventKind::GeoDeleted => "geo.deleted",
            EventKind::ComponentCreated => "component.created",
            EventKind::ComponentUpdated => "component.updated",
            EventKind::ComponentDeleted => "component.deleted",
            EventKind::SystemProxyChanged => "settings.system_proxy_changed",
            EventKind::ProxyConfigChanged => "settings.proxy_config_changed",
            EventKind::FrontendChanged => "settings.frontend_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub entity_id: String,
}

/// 多订阅者广播；无订阅者时发布静默丢弃
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, kind: EventKind, entity_id: impl Into<String>) {
        let _ = self.tx.send(Event {
            kind,
            entity_id: entity_id.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
