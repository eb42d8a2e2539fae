//! 对外操作入口
//!
//! 薄翻译层：HTTP 与 CLI 只调用这里。状态变更全部委托给 Supervisor 与仓储，
//! 自身只负责跨组件的编排（缺内核时安装后重试、停止时关闭系统代理等）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::adapter::AdapterSet;
use crate::common::{fsutil, Result, VeaError};
use crate::config::FrontendSettingsView;
use crate::domain::{
    ComponentKind, CoreComponent, EngineKind, FRouter, InboundMode, InstallStatus, Node,
    ProxyConfig, ServiceState, SystemProxySettings,
};
use crate::engine::{engine_status, recommend_engine, EngineRecommendation, EngineStatus};
use crate::repository::{
    ComponentRepository, FRouterRepository, MemoryStore, NodeRepository, SettingsRepository,
};
use crate::resources::{ComponentInstaller, DOWNLOAD_TIMEOUT};
use crate::supervisor::{KernelLogSnapshot, ProxyStatus, Supervisor};
use crate::sysproxy::{ProxyEndpoint, SystemProxyDriver, SystemProxyRequest, DEFAULT_IGNORE_HOSTS};
use crate::tun::TunCapabilityStatus;

pub const DEFAULT_FROUTER_NAME: &str = "默认路由";
const INSTALL_POLL: Duration = Duration::from_millis(500);
const SYSTEM_PROXY_HOST: &str = "127.0.0.1";

/// 默认创建的内核组件
const DEFAULT_COMPONENTS: [(&str, ComponentKind); 3] = [
    ("xray", ComponentKind::Xray),
    ("sing-box", ComponentKind::Singbox),
    ("clash", ComponentKind::Clash),
];

pub struct FacadeDeps {
    pub store: Arc<MemoryStore>,
    pub supervisor: Arc<Supervisor>,
    pub installer: Arc<dyn ComponentInstaller>,
    pub sysproxy: Arc<dyn SystemProxyDriver>,
    pub adapters: AdapterSet,
}

pub struct Facade {
    store: Arc<MemoryStore>,
    supervisor: Arc<Supervisor>,
    installer: Arc<dyn ComponentInstaller>,
    sysproxy: Arc<dyn SystemProxyDriver>,
    adapters: AdapterSet,
    install_poll: Duration,
    install_timeout: Duration,
}

impl Facade {
    pub fn new(deps: FacadeDeps) -> Self {
        Self {
            store: deps.store,
            supervisor: deps.supervisor,
            installer: deps.installer,
            sysproxy: deps.sysproxy,
            adapters: deps.adapters,
            install_poll: INSTALL_POLL,
            install_timeout: DOWNLOAD_TIMEOUT,
        }
    }

    /// 覆盖安装等待参数
    pub fn with_install_timing(mut self, poll: Duration, timeout: Duration) -> Self {
        self.install_poll = poll;
        self.install_timeout = timeout;
        self
    }

    fn nodes(&self) -> &dyn NodeRepository {
        self.store.as_ref()
    }

    fn frouters(&self) -> &dyn FRouterRepository {
        self.store.as_ref()
    }

    fn components(&self) -> &dyn ComponentRepository {
        self.store.as_ref()
    }

    fn settings(&self) -> &dyn SettingsRepository {
        self.store.as_ref()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // ─── 启动默认数据 ───

    /// 没有任何路由时创建 `local -> direct` 的默认路由，并在未设置时指向它
    pub async fn ensure_default_frouter(&self) -> Result<()> {
        let existing = self.frouters().list().await;
        let target = match existing.first() {
            Some(fr) => fr.id.clone(),
            None => {
                let fr = self
                    .frouters()
                    .create(FRouter::with_direct_default(DEFAULT_FROUTER_NAME))
                    .await?;
                info!(id = %fr.id, "default frouter created");
                fr.id
            }
        };

        let mut cfg = self.settings().proxy_config().await;
        if cfg.frouter_id.trim().is_empty() {
            cfg.frouter_id = target;
            self.settings().update_proxy_config(cfg).await?;
        }
        Ok(())
    }

    pub async fn ensure_default_components(&self) -> Result<()> {
        let existing = self.components().list().await;
        for (name, kind) in DEFAULT_COMPONENTS {
            if existing.iter().any(|c| c.kind == kind) {
                continue;
            }
            self.components()
                .create(CoreComponent::new(name, kind))
                .await?;
        }
        Ok(())
    }

    // ─── 代理生命周期 ───

    /// `cfg` 为空时使用已保存的配置；缺内核时安装并重试一次
    pub async fn start_proxy(&self, cfg: Option<ProxyConfig>) -> Result<()> {
        let cfg = match cfg {
            Some(cfg) => cfg,
            None => self.settings().proxy_config().await,
        };
        match self.run_start(cfg.clone()).await {
            Err(VeaError::EngineNotInstalled { engine }) => {
                info!(engine = %engine, "engine not installed, installing before retry");
                self.ensure_engine_installed(engine).await?;
                self.run_start(cfg).await
            }
            other => other,
        }
    }

    /// Start 在独立任务中执行：调用方（如断开的 HTTP 请求）被丢弃时不会中途打断持锁的流程
    async fn run_start(&self, cfg: ProxyConfig) -> Result<()> {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move { supervisor.start(cfg).await })
            .await
            .map_err(|_| VeaError::Cancelled)?
    }

    /// 停止内核；系统代理若仍指向它则一并关闭，关闭失败时返回错误且设置保持开启
    pub async fn stop_proxy(&self) -> Result<()> {
        self.supervisor.stop_user().await?;

        let _active = self.supervisor.lock_active().await;
        let mut settings = self.settings().system_proxy().await;
        if !settings.enabled {
            return Ok(());
        }
        self.sysproxy
            .apply(&SystemProxyRequest::disabled())
            .await
            .map_err(|e| VeaError::Other(anyhow::Error::new(e).context("disable system proxy")))?;
        settings.enabled = false;
        self.settings().update_system_proxy(settings).await?;
        info!("system proxy disabled after stop");
        Ok(())
    }

    pub fn proxy_status(&self) -> ProxyStatus {
        self.supervisor.status()
    }

    pub async fn mark_restart_scheduled(&self) {
        self.supervisor.mark_restart_scheduled().await
    }

    pub async fn mark_restart_failed(&self, err: &str) {
        self.supervisor.mark_restart_failed(err).await
    }

    pub fn kernel_logs(&self, since: u64) -> KernelLogSnapshot {
        self.supervisor.kernel_logs_since(since)
    }

    // ─── 代理配置 ───

    pub async fn proxy_config(&self) -> ProxyConfig {
        self.settings().proxy_config().await
    }

    /// 只保存，不重启内核
    pub async fn update_proxy_config(&self, cfg: ProxyConfig) -> Result<ProxyConfig> {
        if !cfg.frouter_id.trim().is_empty() {
            self.frouters().get(&cfg.frouter_id).await?;
        }
        self.settings().update_proxy_config(cfg).await
    }

    // ─── 内核组件 ───

    /// 安装并轮询组件记录，直到已安装、失败或超时
    pub async fn ensure_engine_installed(&self, engine: EngineKind) -> Result<()> {
        let kind = ComponentKind::for_engine(engine)
            .ok_or_else(|| VeaError::invalid(format!("cannot install engine {}", engine)))?;
        self.ensure_default_components().await?;
        let component = self.components().get_by_kind(kind).await?;
        if component.is_installed() {
            return Ok(());
        }
        self.spawn_install(&component.id);

        let id = component.id.clone();
        let poll = async {
            loop {
                tokio::time::sleep(self.install_poll).await;
                let c = self.components().get(&id).await?;
                if c.is_installed() {
                    info!(engine = %engine, dir = %c.install_dir, "engine installed");
                    return Ok(());
                }
                if c.install_status == InstallStatus::Error {
                    let msg = [c.install_message, c.last_sync_error]
                        .into_iter()
                        .find(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(VeaError::InstallFailed(format!("{}: {}", engine, msg)));
                }
            }
        };
        tokio::time::timeout(self.install_timeout, poll)
            .await
            .map_err(|_| VeaError::InstallTimeout(engine.to_string()))?
    }

    /// 后台安装；进度写回组件记录
    pub async fn install_component(&self, id: &str) -> Result<CoreComponent> {
        let component = self.components().get(id).await?;
        self.spawn_install(&component.id);
        Ok(component)
    }

    fn spawn_install(&self, id: &str) {
        let installer = Arc::clone(&self.installer);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = installer.install(&id).await {
                warn!(component = %id, error = %e, "component install failed");
            }
        });
    }

    pub async fn list_components(&self) -> Vec<CoreComponent> {
        self.components().list().await
    }

    // ─── 引擎 ───

    pub async fn engine_status(&self) -> EngineStatus {
        let frontend = FrontendSettingsView::from_map(&self.settings().frontend().await);
        engine_status(
            &self.adapters,
            &self.components().list().await,
            &frontend,
            &self.nodes().list().await,
        )
    }

    pub async fn recommend_engine(&self) -> EngineRecommendation {
        recommend_engine(&self.adapters, &self.nodes().list().await)
    }

    // ─── 系统代理 ───

    pub async fn system_proxy_settings(&self) -> SystemProxySettings {
        self.settings().system_proxy().await
    }

    /// 返回保存后的设置与可能的提示；驱动成功后才落盘
    pub async fn update_system_proxy_settings(
        &self,
        mut settings: SystemProxySettings,
    ) -> Result<(SystemProxySettings, Option<String>)> {
        settings.ignore_hosts.retain(|h| !h.trim().is_empty());
        if settings.ignore_hosts.is_empty() {
            settings.ignore_hosts = DEFAULT_IGNORE_HOSTS.iter().map(|h| h.to_string()).collect();
        }

        // 检查与应用在同一段持锁区间内，避免并发 Start 切走内核后按旧端口开启
        let active = self.supervisor.lock_active().await;
        let req = if settings.enabled {
            let cfg = active.cfg();
            if cfg.inbound_mode.is_tun() {
                return Err(VeaError::InboundModeConflict(
                    "TUN 模式已接管全部流量，无需开启系统代理".into(),
                ));
            }
            let engine = active
                .engine()
                .ok_or_else(|| VeaError::invalid("proxy not running"))?;
            system_proxy_request(cfg, engine, &settings.ignore_hosts)
        } else {
            SystemProxyRequest {
                ignore_hosts: settings.ignore_hosts.clone(),
                ..SystemProxyRequest::disabled()
            }
        };

        let advisory = self.sysproxy.apply(&req).await?;
        if let Some(msg) = &advisory {
            warn!(message = %msg, "system proxy applied with advisory");
        }
        let saved = self.settings().update_system_proxy(settings).await?;
        drop(active);
        Ok((saved, advisory))
    }

    // ─── TUN ───

    fn singbox_binary(component: Option<&CoreComponent>) -> Option<PathBuf> {
        let dir = component?.install_dir.trim().to_string();
        if dir.is_empty() {
            return None;
        }
        fsutil::find_binary_in_dir(&PathBuf::from(dir), &["sing-box", "sing-box.exe"])
    }

    async fn installed_singbox(&self) -> Option<PathBuf> {
        let component = self.components().get_by_kind(ComponentKind::Singbox).await.ok();
        Self::singbox_binary(component.as_ref())
    }

    pub async fn check_tun_capabilities(&self) -> TunCapabilityStatus {
        let binary = self.installed_singbox().await;
        self.supervisor.tun().capability_status(binary.as_deref())
    }

    /// 为已安装的 sing-box 配置 TUN 权限（Linux 上可能弹一次授权）
    pub async fn setup_tun(&self) -> Result<TunCapabilityStatus> {
        let binary = self
            .installed_singbox()
            .await
            .ok_or(VeaError::EngineNotInstalled {
                engine: EngineKind::SingBox,
            })?;
        self.supervisor.tun().ensure_capabilities(&binary).await?;
        Ok(self.supervisor.tun().capability_status(Some(&binary)))
    }

    // ─── 仓储透传 ───

    pub async fn snapshot(&self) -> ServiceState {
        self.store.snapshot().await
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        self.nodes().list().await
    }

    pub async fn get_node(&self, id: &str) -> Result<Node> {
        self.nodes().get(id).await
    }

    pub async fn create_node(&self, node: Node) -> Result<Node> {
        self.nodes().create(node).await
    }

    pub async fn update_node(&self, id: &str, node: Node) -> Result<Node> {
        self.nodes().update(id, node).await
    }

    pub async fn delete_node(&self, id: &str) -> Result<()> {
        self.nodes().delete(id).await
    }

    pub async fn list_frouters(&self) -> Vec<FRouter> {
        self.frouters().list().await
    }

    pub async fn get_frouter(&self, id: &str) -> Result<FRouter> {
        self.frouters().get(id).await
    }

    pub async fn create_frouter(&self, frouter: FRouter) -> Result<FRouter> {
        self.frouters().create(frouter).await
    }

    pub async fn update_frouter(&self, id: &str, frouter: FRouter) -> Result<FRouter> {
        self.frouters().update(id, frouter).await
    }

    pub async fn delete_frouter(&self, id: &str) -> Result<()> {
        self.frouters().delete(id).await
    }

    pub async fn frontend_settings(&self) -> Map<String, Value> {
        self.settings().frontend().await
    }

    pub async fn update_frontend_settings(
        &self,
        settings: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        self.settings().update_frontend(settings).await
    }
}

/// 按入站模式决定写入哪些系统代理项；Xray 的 mixed 把 socks 放在 port+1
pub fn system_proxy_request(
    cfg: &ProxyConfig,
    engine: EngineKind,
    ignore_hosts: &[String],
) -> SystemProxyRequest {
    let port = cfg.inbound_port;
    let endpoint = |port: u16| Some(ProxyEndpoint::new(SYSTEM_PROXY_HOST, port));
    let mut req = SystemProxyRequest {
        enabled: true,
        ignore_hosts: ignore_hosts.to_vec(),
        ..Default::default()
    };
    match cfg.inbound_mode {
        InboundMode::Http => {
            req.http = endpoint(port);
            req.https = endpoint(port);
        }
        InboundMode::Socks => req.socks = endpoint(port),
        InboundMode::Mixed => {
            req.http = endpoint(port);
            req.https = endpoint(port);
            let socks_port = if engine == EngineKind::Xray {
                port.saturating_add(1)
            } else {
                port
            };
            req.socks = endpoint(socks_port);
        }
        InboundMode::Tun => {}
    }
    req
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
