//! 内核生命周期的唯一写者
//!
//! 每个公开操作都在同一把锁下串行执行。Start 先完成所有可能失败但代价低的步骤
//! （选引擎、编译、生成配置、定位二进制），然后才停止旧内核；
//! 停止之后的任何失败都会回滚到旧配置与旧进程。
//!
//! `status` 使用 try-lock，Start 进行中也不会阻塞调用方。

pub mod kernel_log;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::adapter::process::{self, log_sink};
use crate::adapter::singbox::extract_rule_set_tags;
use crate::adapter::{AdapterSet, CoreAdapter, GeoFiles, ProcessConfig, ProcessHandle};
use crate::common::{fsutil, platform, Result, VeaError};
use crate::compiler::{Compiler, Purpose};
use crate::config::{FrontendSettingsView, Paths, SupervisorOptions};
use crate::domain::{ComponentKind, EngineKind, LogConfig, ProxyConfig, TunSettings};
use crate::engine::{
    effective_default_engine, installed_engines, recommend_engine, select_engine, EngineRequest,
};
use crate::helper::shim;
use crate::repository::{
    ComponentRepository, FRouterRepository, NodeRepository, SettingsRepository,
};
use crate::resources::{ensure_clash_geodata, ensure_rule_sets, Downloader};
use crate::tun::{InterfaceSnapshot, ReadyPolicy, TunExpectation, TunManager};

pub use kernel_log::{KernelLogSnapshot, KernelLogState};
use state::Previous;
pub use state::{ActiveState, LaunchSpec, ProxyStatus, Running};

const DEFAULT_INBOUND_PORT: u16 = 1080;
const EXPLAIN_FILE: &str = "config.explain.txt";

/// Supervisor 的协作者，全部显式传入
#[derive(Clone)]
pub struct SupervisorDeps {
    pub paths: Paths,
    pub options: SupervisorOptions,
    pub adapters: AdapterSet,
    pub compiler: Arc<dyn Compiler>,
    pub nodes: Arc<dyn NodeRepository>,
    pub frouters: Arc<dyn FRouterRepository>,
    pub components: Arc<dyn ComponentRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub downloader: Arc<dyn Downloader>,
    pub tun: Arc<TunManager>,
}

pub struct Supervisor {
    deps: SupervisorDeps,
    state: Arc<Mutex<ActiveState>>,
    log_state: Arc<std::sync::Mutex<KernelLogState>>,
}

/// 停旧进程之前就已完成的产物
struct Prepared {
    engine: EngineKind,
    adapter: Arc<dyn CoreAdapter>,
    cfg: ProxyConfig,
    config_bytes: Vec<u8>,
    explain: String,
    binary_path: PathBuf,
    geo: GeoFiles,
}

impl Supervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        Self {
            deps,
            state: Arc::new(Mutex::new(ActiveState::default())),
            log_state: Arc::new(std::sync::Mutex::new(KernelLogState::default())),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.deps.paths
    }

    pub fn tun(&self) -> &Arc<TunManager> {
        &self.deps.tun
    }

    // ─── Start ───

    /// 启动（或切换到）`cfg` 描述的内核
    pub async fn start(&self, cfg: ProxyConfig) -> Result<()> {
        let mut st = self.state.lock().await;
        let previous = Previous::capture(&st);

        // 这里失败时旧内核原样保留
        let prepared = self.prepare(cfg).await?;
        info!(
            engine = %prepared.engine,
            frouter = %prepared.cfg.frouter_id,
            mode = %prepared.cfg.inbound_mode,
            "starting kernel"
        );

        self.stop_locked(&mut st).await;

        match self.activate(&mut st, &previous, prepared).await {
            Ok(cfg) => {
                let stored = match self.deps.settings.update_proxy_config(cfg.clone()).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!(error = %e, "persist proxy config failed");
                        cfg
                    }
                };
                st.active_cfg = stored;
                st.last_restart_error = None;
                st.user_stopped = false;
                st.user_stopped_at = None;
                Ok(())
            }
            Err(cause) => Err(self.rollback(&mut st, previous, cause).await),
        }
    }

    /// 补默认值、选引擎、编译、生成配置、定位二进制
    async fn prepare(&self, cfg: ProxyConfig) -> Result<Prepared> {
        let d = &self.deps;
        let frontend = FrontendSettingsView::from_map(&d.settings.frontend().await);
        let nodes = d.nodes.list().await;

        let mut cfg = apply_defaults(cfg, &frontend);
        if cfg.preferred_engine.is_auto() {
            let recommendation = recommend_engine(&d.adapters, &nodes);
            cfg.preferred_engine = effective_default_engine(&frontend, &recommendation);
        }
        if cfg.frouter_id.trim().is_empty() {
            return Err(VeaError::invalid("proxyConfig.frouterId is required"));
        }
        let frouter = d.frouters.get(&cfg.frouter_id).await?;

        let installed = installed_engines(&d.components.list().await);
        let engine = select_engine(
            &d.adapters,
            &EngineRequest {
                mode: cfg.inbound_mode,
                preferred: cfg.preferred_engine,
                frouter: &frouter,
                nodes: &nodes,
                installed: &installed,
            },
        )?;
        let adapter = d.adapters.get(engine).ok_or_else(|| VeaError::NoCompatibleEngine {
            reason: format!("no adapter registered for {}", engine),
        })?;
        adapter.tune(&mut cfg);

        let plan = d
            .compiler
            .compile(Purpose::Proxy, engine, &cfg, &frouter, &nodes)?;
        let geo = GeoFiles::discover(&d.paths);
        let config_bytes = adapter.build_config(&plan, &geo)?;

        // 引用的 .srs 缺失时 sing-box 会在启动期直接退出
        if engine == EngineKind::SingBox {
            let tags = extract_rule_set_tags(&config_bytes)?;
            ensure_rule_sets(d.downloader.as_ref(), &geo.rule_set_dir, &tags)
                .await
                .map_err(|e| VeaError::Other(e.context("ensure sing-box rule-set")))?;
        }

        let binary_path = self.locate_binary(engine, adapter.as_ref()).await?;
        Ok(Prepared {
            engine,
            adapter,
            cfg,
            config_bytes,
            explain: plan.explain(),
            binary_path,
            geo,
        })
    }

    async fn locate_binary(&self, engine: EngineKind, adapter: &dyn CoreAdapter) -> Result<PathBuf> {
        let not_installed = || VeaError::EngineNotInstalled { engine };
        let kind = ComponentKind::for_engine(engine).ok_or_else(not_installed)?;
        let component = self
            .deps
            .components
            .get_by_kind(kind)
            .await
            .map_err(|_| not_installed())?;
        let dir = component.install_dir.trim();
        if dir.is_empty() {
            return Err(not_installed());
        }
        fsutil::find_binary_in_dir(Path::new(dir), adapter.binary_names()).ok_or_else(not_installed)
    }

    /// 旧内核停止之后的步骤；失败由调用方回滚
    async fn activate(
        &self,
        st: &mut ActiveState,
        previous: &Previous,
        p: Prepared,
    ) -> Result<ProxyConfig> {
        let d = &self.deps;

        if let Some(old) = &previous.tun_iface {
            self.wait_previous_tun_gone(old, previous.config_path()).await?;
        }

        let config_dir = d.paths.core_dir(p.engine);
        let config_path = config_dir.join(p.adapter.config_file_name());
        fsutil::write_atomic(&config_path, &p.config_bytes)
            .map_err(|e| VeaError::Other(e.context("write kernel config")))?;
        let _ = fsutil::set_mode(&config_path, 0o600);
        if let Err(e) = fsutil::write_atomic(&config_dir.join(EXPLAIN_FILE), p.explain.as_bytes()) {
            debug!(error = %e, "write config explain failed");
        }

        if p.engine == EngineKind::Clash {
            if let Err(e) =
                ensure_clash_geodata(d.downloader.as_ref(), &d.paths.geo_dir(), &config_dir).await
            {
                warn!(error = %e, "clash geo data incomplete, kernel may download it itself");
            }
        }

        let tun_mode = p.cfg.inbound_mode.is_tun();
        if p.adapter.requires_privileges(&p.cfg) {
            d.tun.ensure_capabilities(&p.binary_path).await?;
        }
        if tun_mode {
            d.tun.cleanup_leftovers().await;
        }
        let snapshot = tun_mode.then(|| d.tun.snapshot());

        let launch = LaunchSpec {
            engine: p.engine,
            binary_path: p.binary_path.clone(),
            config_path,
            cfg: p.cfg.clone(),
        };
        let handle = self.launch(st, p.adapter.as_ref(), &launch, &p.geo).await?;

        if let Err(e) = self
            .wait_ready(st, p.adapter.as_ref(), &handle, &p.cfg, snapshot.as_ref())
            .await
        {
            warn!(engine = %p.engine, error = %e, "kernel not ready, stopping it");
            if let Err(stop_err) = p.adapter.stop(&handle, d.options.stop_grace).await {
                warn!(error = %stop_err, "stop unready kernel failed");
            }
            st.clear_runtime();
            return Err(e);
        }
        Ok(p.cfg)
    }

    /// 旧 TUN 设备未释放时新内核会报 "device or resource busy"
    async fn wait_previous_tun_gone(&self, iface: &str, config_path: Option<&PathBuf>) -> Result<()> {
        let tun = &self.deps.tun;
        let timeout = self.deps.options.tun_absent_timeout;
        if tun.wait_absent(iface, timeout).await {
            return Ok(());
        }
        warn!(interface = iface, "previous TUN still present, killing leftover kernel");
        if let Some(path) = config_path {
            tun.kill_processes_using_config(path).await;
        }
        if tun.wait_absent(iface, timeout).await {
            return Ok(());
        }
        Err(VeaError::TunBusy(iface.to_string()))
    }

    /// 打开日志会话并启动进程，成功后登记为当前内核
    async fn launch(
        &self,
        st: &mut ActiveState,
        adapter: &dyn CoreAdapter,
        spec: &LaunchSpec,
        geo: &GeoFiles,
    ) -> Result<Arc<ProcessHandle>> {
        let config_dir = spec
            .config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.deps.paths.core_dir(spec.engine));

        let mut proc_cfg = ProcessConfig {
            binary_path: spec.binary_path.clone(),
            config_dir: config_dir.clone(),
            env: adapter.process_env(geo),
            port: adapter.probe_port(&spec.cfg),
            ..Default::default()
        };
        if cfg!(target_os = "linux")
            && spec.engine == EngineKind::SingBox
            && spec.cfg.inbound_mode.is_tun()
        {
            self.attach_resolvectl_shim(&mut proc_cfg);
        }

        let session = kernel_log::open_session(
            &config_dir.join(kernel_log::KERNEL_LOG_NAME),
            &self.deps.paths.fallback_kernel_log(),
            spec.engine,
        );
        let log_path = session.as_ref().map(|(path, _)| path.clone());
        proc_cfg.log = session.map(|(_, file)| log_sink(file));

        let handle = adapter.start(&proc_cfg, &spec.config_path).await?;

        st.main = Some(Running {
            handle: handle.clone(),
            launch: spec.clone(),
        });
        st.tun_iface = None;
        {
            let mut log = self.log_state.lock().unwrap_or_else(PoisonError::into_inner);
            *log = KernelLogState {
                path: log_path,
                session: log.session + 1,
                started_at: Some(handle.started_at),
                engine: Some(spec.engine),
                handle: Some(handle.clone()),
                singbox_output: spec.cfg.log_config.as_ref().map(|l| l.output.clone()),
            };
        }
        self.spawn_monitor(handle.clone(), spec.engine);

        info!(engine = %spec.engine, pid = ?handle.pid, config = %spec.config_path.display(), "kernel started");
        Ok(handle)
    }

    /// sing-box 在 TUN 下会反复调用 resolvectl；经 PATH shim 转发给同一个特权 helper
    fn attach_resolvectl_shim(&self, proc_cfg: &mut ProcessConfig) {
        let shim_dir = self.deps.paths.shim_dir();
        if let Err(e) = shim::ensure_shim(&shim_dir) {
            warn!(error = %e, "resolvectl shim unavailable");
            return;
        }
        let exe = match std::env::current_exe().and_then(|p| p.canonicalize()) {
            Ok(exe) => exe,
            Err(e) => {
                warn!(error = %e, "cannot resolve own executable for resolvectl shim");
                return;
            }
        };
        proc_cfg.env.extend(shim::shim_env(
            &exe,
            &self.deps.paths.helper_socket(),
            platform::current_uid(),
            std::process::id(),
        ));
        proc_cfg.path_prepend.push(shim_dir);
    }

    async fn wait_ready(
        &self,
        st: &mut ActiveState,
        adapter: &dyn CoreAdapter,
        handle: &ProcessHandle,
        cfg: &ProxyConfig,
        snapshot: Option<&InterfaceSnapshot>,
    ) -> Result<()> {
        let opts = &self.deps.options;
        if let Some(snapshot) = snapshot {
            let expect = TunExpectation::from_settings(&cfg.tun());
            let policy = ReadyPolicy {
                timeout: opts.tun_ready_timeout,
                tun_like_after: opts.tun_like_threshold,
                ..Default::default()
            };
            let name = self
                .deps
                .tun
                .wait_ready(&expect, snapshot, &handle.done_token(), policy)
                .await?;
            info!(interface = %name, "TUN interface ready");
            st.tun_iface = Some(name);
        }
        if handle.port > 0 {
            adapter
                .wait_for_ready(handle, opts.ready_timeout)
                .await
                .map_err(|e| match e {
                    VeaError::ProcessNotReady(_) => e,
                    other => VeaError::ProcessNotReady(other.to_string()),
                })?;
        }
        Ok(())
    }

    /// 恢复旧配置文件、重启旧内核、恢复 active 配置；各步失败并入返回的错误
    async fn rollback(&self, st: &mut ActiveState, previous: Previous, cause: VeaError) -> VeaError {
        st.active_cfg = previous.cfg.clone();
        let Some(launch) = previous.launch.as_ref() else {
            return cause;
        };
        warn!(error = %cause, engine = %launch.engine, "start failed after stopping previous kernel, rolling back");

        let mut problems = Vec::new();
        if let Some(bytes) = &previous.config_bytes {
            if let Err(e) = fsutil::write_atomic(&launch.config_path, bytes) {
                problems.push(format!("restore config: {:#}", e));
            }
        }

        match self.deps.adapters.get(launch.engine) {
            None => problems.push(format!("no adapter for {}", launch.engine)),
            Some(_) if !launch.binary_path.is_file() => problems.push(format!(
                "previous binary missing: {}",
                launch.binary_path.display()
            )),
            Some(adapter) => {
                let geo = GeoFiles::discover(&self.deps.paths);
                // 与正向路径相同：重启后的 TUN 接口确实出现才登记
                let snapshot = launch
                    .cfg
                    .inbound_mode
                    .is_tun()
                    .then(|| self.deps.tun.snapshot());
                match self.launch(st, adapter.as_ref(), launch, &geo).await {
                    Ok(handle) => {
                        if let Err(e) = self
                            .wait_ready(st, adapter.as_ref(), &handle, &launch.cfg, snapshot.as_ref())
                            .await
                        {
                            problems.push(format!("previous kernel not ready: {}", e));
                        }
                    }
                    Err(e) => problems.push(format!("restart previous kernel: {}", e)),
                }
            }
        }

        if problems.is_empty() {
            info!(engine = %launch.engine, "rolled back to previous kernel");
            cause
        } else {
            VeaError::RollbackFailed {
                cause: Box::new(cause),
                rollback: problems.join("; "),
            }
        }
    }

    // ─── Stop ───

    pub async fn stop(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        self.stop_locked(&mut st).await;
        Ok(())
    }

    /// 用户主动停止；保活策略据此不再自动拉起
    pub async fn stop_user(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        self.stop_locked(&mut st).await;
        st.user_stopped = true;
        st.user_stopped_at = Some(Utc::now());
        Ok(())
    }

    /// 不改动 active 配置
    async fn stop_locked(&self, st: &mut ActiveState) {
        let running = st.main.take();
        st.tun_iface = None;
        let Some(running) = running else {
            return;
        };
        let grace = self.deps.options.stop_grace;
        match self.deps.adapters.get(running.engine()) {
            Some(adapter) => {
                if let Err(e) = adapter.stop(&running.handle, grace).await {
                    warn!(engine = %running.engine(), error = %e, "adapter stop failed");
                }
            }
            None => process::terminate(&running.handle, grace).await,
        }
        info!(engine = %running.engine(), pid = ?running.handle.pid, "kernel stopped");
    }

    /// 进程退出后：关日志，若仍是当前句柄则清理运行态。从不自动重启。
    fn spawn_monitor(&self, handle: Arc<ProcessHandle>, engine: EngineKind) {
        let state = self.state.clone();
        tokio::spawn(async move {
            handle.exited().await;
            handle.close_log();
            let mut st = state.lock().await;
            if st.is_current(handle.id) {
                warn!(
                    engine = %engine,
                    pid = ?handle.pid,
                    code = ?handle.exit_code(),
                    "kernel exited unexpectedly"
                );
                st.clear_runtime();
            }
        });
    }

    // ─── 查询 ───

    /// 锁被占用时立即返回 `busy`
    pub fn status(&self) -> ProxyStatus {
        match self.state.try_lock() {
            Ok(st) => ProxyStatus::project(&st),
            Err(_) => ProxyStatus::busy(),
        }
    }

    /// 持锁读取当前内核；守卫存活期间 Start/Stop 都要排队，
    /// 依赖"内核正在跑什么"的外部副作用（如系统代理）应在守卫内完成
    pub async fn lock_active(&self) -> ActiveGuard<'_> {
        ActiveGuard {
            st: self.state.lock().await,
        }
    }

    pub fn kernel_logs_since(&self, since: u64) -> KernelLogSnapshot {
        let log = self
            .log_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        kernel_log::snapshot(&log, since, self.deps.options.kernel_log_chunk)
    }

    pub async fn mark_restart_scheduled(&self) {
        let mut st = self.state.lock().await;
        st.last_restart_at = Some(Utc::now());
    }

    pub async fn mark_restart_failed(&self, err: &str) {
        let mut st = self.state.lock().await;
        st.last_restart_at = Some(Utc::now());
        st.last_restart_error = Some(err.to_string());
    }
}

/// [`Supervisor::lock_active`] 的只读视图
pub struct ActiveGuard<'a> {
    st: MutexGuard<'a, ActiveState>,
}

impl ActiveGuard<'_> {
    /// 运行中的引擎；未运行时为 None
    pub fn engine(&self) -> Option<EngineKind> {
        self.st.live().map(Running::engine)
    }

    pub fn cfg(&self) -> &ProxyConfig {
        &self.st.active_cfg
    }
}

/// 入站模式/端口/TUN 默认值；内核日志统一 debug 级别
pub fn apply_defaults(mut cfg: ProxyConfig, frontend: &FrontendSettingsView) -> ProxyConfig {
    if cfg.inbound_port == 0 && !cfg.inbound_mode.is_tun() {
        cfg.inbound_port = frontend.proxy_port.unwrap_or(DEFAULT_INBOUND_PORT);
    }
    let log = cfg.log_config.get_or_insert_with(LogConfig::default);
    log.level = "debug".to_string();
    log.timestamp = true;
    if cfg.inbound_mode.is_tun() {
        cfg.tun_settings
            .get_or_insert_with(TunSettings::default)
            .fill_defaults();
    }
    cfg
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
