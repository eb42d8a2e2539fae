//! Supervisor 独占的运行时状态

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::ProcessHandle;
use crate::domain::{EngineKind, InboundMode, ProxyConfig};

/// 重启一个内核所需的全部信息，回滚时复用
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub engine: EngineKind,
    pub binary_path: PathBuf,
    pub config_path: PathBuf,
    pub cfg: ProxyConfig,
}

/// 正在运行的内核；句柄与引擎总是成对出现
#[derive(Debug, Clone)]
pub struct Running {
    pub handle: Arc<ProcessHandle>,
    pub launch: LaunchSpec,
}

impl Running {
    pub fn engine(&self) -> EngineKind {
        self.launch.engine
    }
}

#[derive(Debug, Default)]
pub struct ActiveState {
    pub main: Option<Running>,
    pub active_cfg: ProxyConfig,
    /// 仅在 TUN 内核存活期间非空
    pub tun_iface: Option<String>,
    pub user_stopped: bool,
    pub user_stopped_at: Option<DateTime<Utc>>,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub last_restart_error: Option<String>,
}

impl ActiveState {
    /// 句柄仍存活才算运行中
    pub fn live(&self) -> Option<&Running> {
        self.main.as_ref().filter(|r| r.handle.is_running())
    }

    pub fn is_current(&self, handle_id: u64) -> bool {
        self.main.as_ref().map(|r| r.handle.id) == Some(handle_id)
    }

    pub fn clear_runtime(&mut self) {
        self.main = None;
        self.tun_iface = None;
    }
}

/// Start 开始前的快照，失败回滚用
#[derive(Debug, Default)]
pub(crate) struct Previous {
    pub launch: Option<LaunchSpec>,
    pub cfg: ProxyConfig,
    pub config_bytes: Option<Vec<u8>>,
    pub tun_iface: Option<String>,
}

impl Previous {
    pub fn capture(st: &ActiveState) -> Self {
        let launch = st.live().map(|r| r.launch.clone());
        let config_bytes = launch
            .as_ref()
            .and_then(|l| std::fs::read(&l.config_path).ok());
        Self {
            launch,
            cfg: st.active_cfg.clone(),
            config_bytes,
            tun_iface: st.tun_iface.clone(),
        }
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.launch.as_ref().map(|l| &l.config_path)
    }
}

/// 只读状态投影
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub running: bool,
    /// 另一个操作正持有锁
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    #[serde(rename = "frouterId", skip_serializing_if = "Option::is_none")]
    pub frouter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_mode: Option<InboundMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tun_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub user_stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_stopped_at: Option<DateTime<Utc>>,
}

impl ProxyStatus {
    pub fn busy() -> Self {
        Self {
            busy: true,
            ..Default::default()
        }
    }

    pub fn project(st: &ActiveState) -> Self {
        let live = st.live();
        let cfg = &st.active_cfg;
        Self {
            running: live.is_some(),
            busy: false,
            pid: live.and_then(|r| r.handle.pid),
            engine: live.map(Running::engine),
            frouter_id: (!cfg.frouter_id.is_empty()).then(|| cfg.frouter_id.clone()),
            inbound_mode: (!cfg.frouter_id.is_empty()).then_some(cfg.inbound_mode),
            inbound_port: (cfg.inbound_port > 0).then_some(cfg.inbound_port),
            tun_interface: live.and(st.tun_iface.clone()),
            last_restart_at: st.last_restart_at,
            last_restart_error: st.last_restart_error.clone(),
            user_stopped: st.user_stopped,
            user_stopped_at: st.user_stopped_at,
        }
    }
}
