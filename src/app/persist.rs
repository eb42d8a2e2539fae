//! 状态快照持久化
//!
//! 订阅仓储事件总线，事件到达后延迟一个防抖窗口再整体保存；保存进行中
//! 又有新事件时置 dirty，当前保存结束后再补一次。写入走 `<path>.tmp` + rename。
//!
//! 加载是严格的：只接受当前 schemaVersion 或可迁移的旧版本，
//! 其余任何解析失败都拒绝启动，避免用空状态覆盖用户数据。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{fsutil, Result, VeaError};
use crate::domain::{Node, ServiceState, LEGACY_SCHEMA_VERSION, SCHEMA_VERSION};
use crate::repository::{EventBus, MemoryStore};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

// ─── 加载 ───

/// 文件不存在或为空时返回 None（全新安装）
pub fn load_state(path: &Path) -> Result<Option<ServiceState>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    decode_state(&bytes).map(Some)
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default, rename = "schemaVersion")]
    schema_version: String,
}

/// 2.0.0 的 FRouter 内嵌节点列表
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyFRouter {
    #[serde(default)]
    source_config_id: String,
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Deserialize)]
struct LegacyEnvelope {
    #[serde(default)]
    frouters: Vec<LegacyFRouter>,
}

pub fn decode_state(bytes: &[u8]) -> Result<ServiceState> {
    let corrupt = |e: serde_json::Error| VeaError::PersistLoadCorrupt(e.to_string());
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(corrupt)?;

    match envelope.schema_version.as_str() {
        SCHEMA_VERSION => serde_json::from_slice(bytes).map_err(corrupt),
        LEGACY_SCHEMA_VERSION => {
            // FRouter 反序列化时忽略多余的 nodes 字段，节点另行提取
            let mut state: ServiceState = serde_json::from_slice(bytes).map_err(corrupt)?;
            let legacy: LegacyEnvelope = serde_json::from_slice(bytes).map_err(corrupt)?;
            hoist_legacy_nodes(&mut state, legacy.frouters);
            state.schema_version = SCHEMA_VERSION.to_string();
            info!(from = LEGACY_SCHEMA_VERSION, to = SCHEMA_VERSION, "state migrated");
            Ok(state)
        }
        "" => Err(VeaError::PersistLoadCorrupt("missing schemaVersion".into())),
        other => Err(VeaError::PersistLoadCorrupt(format!(
            "unsupported schemaVersion {} (expected {})",
            other, SCHEMA_VERSION
        ))),
    }
}

/// 把路由内嵌的节点提到顶层；按 ID 去重，已有节点优先
fn hoist_legacy_nodes(state: &mut ServiceState, frouters: Vec<LegacyFRouter>) {
    state.nodes.retain(|n| !n.id.is_empty());
    let mut seen: HashSet<String> = HashSet::new();
    state.nodes.retain(|n| seen.insert(n.id.clone()));

    for fr in frouters {
        for mut node in fr.nodes {
            if node.id.is_empty() || !seen.insert(node.id.clone()) {
                continue;
            }
            if node.source_config_id.is_empty() {
                node.source_config_id = fr.source_config_id.clone();
            }
            state.nodes.push(node);
        }
    }
}

// ─── 保存 ───

#[derive(Default)]
struct Schedule {
    pending: bool,
    dirty: bool,
}

pub struct Persistor {
    path: PathBuf,
    store: Arc<MemoryStore>,
    debounce: Duration,
    schedule: Mutex<Schedule>,
    /// 保存串行化
    save_gate: tokio::sync::Mutex<()>,
}

impl Persistor {
    pub fn new(path: PathBuf, store: Arc<MemoryStore>) -> Self {
        Self {
            path,
            store,
            debounce: DEFAULT_DEBOUNCE,
            schedule: Mutex::new(Schedule::default()),
            save_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 立即保存当前快照
    pub async fn save_now(&self) -> Result<()> {
        let _gate = self.save_gate.lock().await;
        let state = self.store.snapshot().await;
        let data = serde_json::to_vec_pretty(&state).context("encode state")?;
        fsutil::write_atomic(&self.path, &data)?;
        debug!(path = %self.path.display(), bytes = data.len(), "state saved");
        Ok(())
    }

    /// 防抖调度一次保存
    pub fn schedule(self: &Arc<Self>) {
        {
            let mut s = self.schedule.lock().unwrap_or_else(PoisonError::into_inner);
            if s.pending {
                s.dirty = true;
                return;
            }
            s.pending = true;
            s.dirty = false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.debounce).await;
                if let Err(e) = this.save_now().await {
                    warn!(path = %this.path.display(), error = %e, "state save failed");
                }
                let mut s = this.schedule.lock().unwrap_or_else(PoisonError::into_inner);
                if s.dirty {
                    s.dirty = false;
                    continue;
                }
                s.pending = false;
                break;
            }
        });
    }

    /// 订阅事件总线；`cancel` 触发后最后保存一次再退出
    pub fn spawn(self: &Arc<Self>, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = this.save_now().await {
                            warn!(error = %e, "final state save failed");
                        }
                        break;
                    }
                    ev = rx.recv() => match ev {
                        Ok(ev) => {
                            debug!(event = %ev.kind, id = %ev.entity_id, "state changed");
                            this.schedule();
                        }
                        // 丢了事件也只需要再存一次
                        Err(RecvError::Lagged(_)) => this.schedule(),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::{FRouter, NodeProtocol};
    use crate::repository::{FRouterRepository, NodeRepository};

    #[test]
    fn missing_and_empty_files_are_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(load_state(&path).unwrap().is_none());
        std::fs::write(&path, b"  \n").unwrap();
        assert!(load_state(&path).unwrap().is_none());
    }

    #[test]
    fn garbage_and_unknown_versions_rejected() {
        let err = decode_state(b"{not json").unwrap_err();
        assert!(matches!(err, VeaError::PersistLoadCorrupt(_)));

        let err = decode_state(br#"{"nodes":[]}"#).unwrap_err();
        assert!(err.to_string().contains("missing schemaVersion"));

        let err = decode_state(br#"{"schemaVersion":"9.9.9"}"#).unwrap_err();
        assert!(err.to_string().contains("9.9.9"));
    }

    #[test]
    fn legacy_nodes_are_hoisted() {
        let doc = json!({
            "schemaVersion": "2.0.0",
            "nodes": [
                {"id": "n1", "name": "a", "address": "1.1.1.1", "port": 443, "protocol": "vless"}
            ],
            "frouters": [{
                "id": "fr1",
                "name": "r",
                "sourceConfigId": "cfg-1",
                "nodes": [
                    {"id": "n1", "name": "dup", "address": "9.9.9.9", "port": 1, "protocol": "vless"},
                    {"id": "n2", "name": "b", "address": "2.2.2.2", "port": 8443, "protocol": "trojan"}
                ],
                "chainProxy": {"edges": []}
            }],
            "generatedAt": "2024-01-01T00:00:00Z"
        });
        let state = decode_state(doc.to_string().as_bytes()).unwrap();
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert_eq!(state.frouters.len(), 1);
        let ids: Vec<&str> = state.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert_eq!(state.nodes[0].name, "a");
        assert_eq!(state.nodes[1].source_config_id, "cfg-1");
    }

    #[tokio::test]
    async fn bursts_coalesce_and_final_state_lands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("state.json");
        let bus = EventBus::default();
        let store = Arc::new(MemoryStore::new(bus.clone()));
        let persistor = Arc::new(
            Persistor::new(path.clone(), store.clone()).with_debounce(Duration::from_millis(30)),
        );
        let cancel = CancellationToken::new();
        let task = persistor.spawn(&bus, cancel.clone());

        for i in 0..5 {
            NodeRepository::create(
                store.as_ref(),
                Node::new(&format!("n{i}"), "1.2.3.4", 443, NodeProtocol::Vless),
            )
            .await
            .unwrap();
        }
        FRouterRepository::create(store.as_ref(), FRouter::with_direct_default("r"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let saved = load_state(&path).unwrap().unwrap();
        assert_eq!(saved.nodes.len(), 5);
        assert_eq!(saved.frouters.len(), 1);
        assert!(!path.with_extension("json.tmp").exists());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let bus = EventBus::default();
        let store = Arc::new(MemoryStore::new(bus.clone()));
        let persistor = Arc::new(
            Persistor::new(path.clone(), store.clone()).with_debounce(Duration::from_secs(60)),
        );
        let cancel = CancellationToken::new();
        let task = persistor.spawn(&bus, cancel.clone());

        NodeRepository::create(
            store.as_ref(),
            Node::new("n", "1.2.3.4", 443, NodeProtocol::Trojan),
        )
        .await
        .unwrap();
        cancel.cancel();
        task.await.unwrap();

        let saved = load_state(&path).unwrap().unwrap();
        assert_eq!(saved.nodes.len(), 1);
    }
}
