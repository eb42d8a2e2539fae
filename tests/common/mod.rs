//! 集成测试共用的假内核与装配

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use vea::adapter::{AdapterSet, CoreAdapter, GeoFiles, ProcessHandle};
use vea::app::{Facade, FacadeDeps};
use vea::common::{Result, VeaError};
use vea::compiler::{GraphCompiler, RuntimePlan};
use vea::config::{Paths, SupervisorOptions};
use vea::domain::{ComponentKind, CoreComponent, EngineKind, InboundMode, NodeProtocol};
use vea::helper::NoHelper;
use vea::repository::{ComponentRepository, EventBus, MemoryStore};
use vea::resources::{ComponentInstaller, Downloader};
use vea::supervisor::{Supervisor, SupervisorDeps};
use vea::sysproxy::{SystemProxyDriver, SystemProxyRequest};
use vea::tun::{InterfaceInfo, InterfaceProbe, SystemCapabilityProbe, TunManager};

pub const KERNEL_BINARY: &str = "fake-kernel";

/// 写一个可执行脚本
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// 以 shell 脚本冒充内核；就绪判定为"进程仍存活"
pub struct FakeKernel {
    pub kind: EngineKind,
    /// 是否声明支持 TUN 入站
    pub tun: bool,
}

impl FakeKernel {
    pub fn new(kind: EngineKind) -> Self {
        Self { kind, tun: false }
    }

    pub fn with_tun(kind: EngineKind) -> Self {
        Self { kind, tun: true }
    }
}

#[async_trait]
impl CoreAdapter for FakeKernel {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn binary_names(&self) -> &'static [&'static str] {
        &[KERNEL_BINARY]
    }

    fn supported_protocols(&self) -> &'static [NodeProtocol] {
        &[NodeProtocol::Vless, NodeProtocol::Trojan]
    }

    fn supports_inbound(&self, mode: InboundMode) -> bool {
        self.tun || !mode.is_tun()
    }

    fn build_config(&self, plan: &RuntimePlan, _geo: &GeoFiles) -> Result<Vec<u8>> {
        let doc = serde_json::json!({
            "engine": self.kind.to_string(),
            "frouter": plan.frouter_id,
            "port": plan.proxy_config.inbound_port,
        });
        Ok(serde_json::to_vec_pretty(&doc).map_err(anyhow::Error::from)?)
    }

    fn command_args(&self, config_path: &Path) -> Vec<String> {
        vec![config_path.display().to_string()]
    }

    async fn wait_for_ready(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()> {
        let settle = timeout.min(Duration::from_millis(300));
        tokio::select! {
            _ = handle.exited() => Err(VeaError::ProcessNotReady(format!(
                "kernel exited with {:?}",
                handle.exit_code()
            ))),
            _ = tokio::time::sleep(settle) => Ok(()),
        }
    }
}

pub struct NoInterfaces;

impl InterfaceProbe for NoInterfaces {
    fn interfaces(&self) -> anyhow::Result<Vec<InterfaceInfo>> {
        Ok(Vec::new())
    }
}

/// 把标记文件当作 TUN 网卡：文件存在即接口存在，文件内容（内核 pid）作 ifindex
///
/// `lingering` 打开后，标记文件删除时仍报告最后一次见到的接口，模拟迟迟不释放的旧 TUN。
pub struct MarkerProbe {
    pub name: String,
    pub marker: PathBuf,
    pub lingering: AtomicBool,
    last: Mutex<Option<InterfaceInfo>>,
}

impl MarkerProbe {
    pub fn new(name: &str, marker: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            marker,
            lingering: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    pub fn linger(&self, on: bool) {
        self.lingering.store(on, Ordering::SeqCst);
    }
}

impl InterfaceProbe for MarkerProbe {
    fn interfaces(&self) -> anyhow::Result<Vec<InterfaceInfo>> {
        let mut last = self.last.lock().unwrap();
        let index = std::fs::read_to_string(&self.marker)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        if let Some(index) = index {
            let info = InterfaceInfo {
                name: self.name.clone(),
                index,
                ..Default::default()
            };
            *last = Some(info.clone());
            return Ok(vec![info]);
        }
        if self.lingering.load(Ordering::SeqCst) {
            return Ok(last.clone().into_iter().collect());
        }
        Ok(Vec::new())
    }
}

/// 任何 URL 都返回固定内容（用来补齐 rule-set）
pub struct CannedDownloader;

#[async_trait]
impl Downloader for CannedDownloader {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        Ok(format!("canned {}", url).into_bytes())
    }
}

/// 把预先准备好的目录登记为安装结果
pub struct DirInstaller {
    pub store: Arc<MemoryStore>,
    pub dir: PathBuf,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ComponentInstaller for DirInstaller {
    async fn install(&self, component_id: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(component_id.to_string());
        self.store
            .set_installed(component_id, &self.dir.display().to_string(), "v0.0.1", "")
            .await?;
        Ok(())
    }
}

/// 记录每次成功的系统代理变更；`fail_disable` 打开后关闭请求一律失败
#[derive(Default)]
pub struct RecordingProxy {
    pub applied: Mutex<Vec<SystemProxyRequest>>,
    pub fail_disable: AtomicBool,
}

#[async_trait]
impl SystemProxyDriver for RecordingProxy {
    async fn apply(&self, req: &SystemProxyRequest) -> Result<Option<String>> {
        if !req.enabled && self.fail_disable.load(Ordering::SeqCst) {
            return Err(VeaError::Other(anyhow::anyhow!("gsettings: dconf unavailable")));
        }
        self.applied.lock().unwrap().push(req.clone());
        Ok(None)
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub paths: Paths,
    pub store: Arc<MemoryStore>,
    pub supervisor: Arc<Supervisor>,
    pub facade: Arc<Facade>,
    pub installer: Arc<DirInstaller>,
    pub sysproxy: Arc<RecordingProxy>,
    /// 仅 `with_tun` 装配时接入 TunManager
    pub tun_probe: Arc<MarkerProbe>,
    /// 存放"健康"假内核的目录
    pub healthy_dir: PathBuf,
    /// 存放启动即退出的假内核的目录
    pub crashing_dir: PathBuf,
    /// 存放会"建网卡"的假内核的目录
    pub tun_dir: PathBuf,
}

/// TUN 假内核使用的接口名
pub const TUN_IFACE: &str = "vea-test-tun";

impl Harness {
    /// Xray 与 sing-box 都由假内核顶替，均不支持 TUN
    pub async fn new() -> Self {
        Self::build(false).await
    }

    /// sing-box 假内核支持 TUN：启动后写标记文件冒充网卡，收到 SIGTERM 时删除
    pub async fn with_tun() -> Self {
        Self::build(true).await
    }

    async fn build(tun: bool) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_roots(tmp.path().join("artifacts"), tmp.path().join("data"));
        let healthy_dir = tmp.path().join("bin-ok");
        let crashing_dir = tmp.path().join("bin-crash");
        let tun_dir = tmp.path().join("bin-tun");
        let marker = tmp.path().join("tun-up");
        write_script(&healthy_dir, KERNEL_BINARY, "echo \"kernel up $1\"\nexec sleep 60");
        write_script(&crashing_dir, KERNEL_BINARY, "echo \"boom\" >&2\nexit 3");
        write_script(
            &tun_dir,
            KERNEL_BINARY,
            &format!(
                "M=\"{}\"\necho \"tun kernel up $1\"\nsleep 60 &\nchild=$!\ntrap 'rm -f \"$M\"; kill $child; exit 0' TERM INT\necho $$ > \"$M\"\nwait $child",
                marker.display()
            ),
        );

        let store = Arc::new(MemoryStore::new(EventBus::default()));
        let singbox = if tun {
            FakeKernel::with_tun(EngineKind::SingBox)
        } else {
            FakeKernel::new(EngineKind::SingBox)
        };
        let adapters = AdapterSet::empty()
            .with(Arc::new(FakeKernel::new(EngineKind::Xray)))
            .with(Arc::new(singbox));
        let tun_probe = Arc::new(MarkerProbe::new(TUN_IFACE, marker));
        let interfaces: Arc<dyn InterfaceProbe> = if tun {
            tun_probe.clone()
        } else {
            Arc::new(NoInterfaces)
        };
        let tun_manager = Arc::new(TunManager::new(
            Arc::new(NoHelper),
            interfaces,
            Arc::new(SystemCapabilityProbe),
        ));
        let options = SupervisorOptions {
            ready_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(2),
            tun_ready_timeout: Duration::from_secs(3),
            tun_absent_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let supervisor = Arc::new(Supervisor::new(SupervisorDeps {
            paths: paths.clone(),
            options,
            adapters: adapters.clone(),
            compiler: Arc::new(GraphCompiler),
            nodes: store.clone(),
            frouters: store.clone(),
            components: store.clone(),
            settings: store.clone(),
            downloader: Arc::new(CannedDownloader),
            tun: tun_manager,
        }));
        let installer = Arc::new(DirInstaller {
            store: store.clone(),
            dir: healthy_dir.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let sysproxy = Arc::new(RecordingProxy::default());
        let facade = Arc::new(
            Facade::new(FacadeDeps {
                store: store.clone(),
                supervisor: supervisor.clone(),
                installer: installer.clone(),
                sysproxy: sysproxy.clone(),
                adapters,
            })
            .with_install_timing(Duration::from_millis(20), Duration::from_secs(2)),
        );
        facade.ensure_default_components().await.unwrap();
        facade.ensure_default_frouter().await.unwrap();

        Self {
            tmp,
            paths,
            store,
            supervisor,
            facade,
            installer,
            sysproxy,
            tun_probe,
            healthy_dir,
            crashing_dir,
            tun_dir,
        }
    }

    /// 直接把组件标记为已安装在 `dir`
    pub async fn install(&self, kind: ComponentKind, dir: &Path) {
        let c: CoreComponent = self.store.get_by_kind(kind).await.unwrap();
        self.store
            .set_installed(&c.id, &dir.display().to_string(), "test", "")
            .await
            .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        // 测试中途失败时也别留下 sleep 进程
        if let Some(pid) = self.supervisor.status().pid {
            let _ = std::process::Command::new("kill")
                .arg(pid.to_string())
                .status();
        }
    }
}
