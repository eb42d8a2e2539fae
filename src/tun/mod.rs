//! TUN 模式：权限、接口就绪/消失、残留清理
//!
//! 平台差异集中在这里：Linux 用文件 capabilities（经特权 helper 配置），
//! macOS 要求进程本身是 root，Windows 要求管理员。

pub mod caps;
pub mod cleanup;
pub mod iface;
pub mod setup;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::{platform, Result, VeaError};
use crate::helper::{HelperRequest, PrivilegedHelper};

pub use caps::{CapabilityProbe, SystemCapabilityProbe, TunCapabilityStatus};
pub use iface::{
    InterfaceInfo, InterfaceProbe, InterfaceSnapshot, ReadyPolicy, SystemProbe, TunExpectation,
};

/// 消失等待的轮询间隔
const ABSENT_POLL: Duration = Duration::from_millis(200);

pub struct TunManager {
    helper: Arc<dyn PrivilegedHelper>,
    interfaces: Arc<dyn InterfaceProbe>,
    capabilities: Arc<dyn CapabilityProbe>,
    /// 并发的权限配置合并为一次授权
    setup_gate: tokio::sync::Mutex<()>,
}

impl TunManager {
    pub fn new(
        helper: Arc<dyn PrivilegedHelper>,
        interfaces: Arc<dyn InterfaceProbe>,
        capabilities: Arc<dyn CapabilityProbe>,
    ) -> Self {
        Self {
            helper,
            interfaces,
            capabilities,
            setup_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// 真实系统探测
    pub fn system(helper: Arc<dyn PrivilegedHelper>) -> Self {
        Self::new(helper, Arc::new(SystemProbe), Arc::new(SystemCapabilityProbe))
    }

    pub fn capability_status(&self, binary: Option<&Path>) -> TunCapabilityStatus {
        self.capabilities.status(binary)
    }

    /// 确保内核二进制能以普通用户建 TUN；Linux 上最多弹一次授权
    pub async fn ensure_capabilities(&self, binary: &Path) -> Result<()> {
        if cfg!(target_os = "macos") {
            return require_root("TUN 模式需要 root 权限：请使用 sudo 运行 vea");
        }
        if cfg!(windows) {
            return require_root("TUN 模式需要管理员权限：请以管理员身份运行 Vea");
        }

        let _gate = self.setup_gate.lock().await;
        let status = self.capabilities.status(Some(binary));
        if status.usable() {
            return Ok(());
        }
        if !status.binary_found {
            return Err(VeaError::NotFound(format!(
                "kernel binary not found: {}",
                binary.display()
            )));
        }

        info!(
            binary = %binary.display(),
            user_exists = status.user_exists,
            missing = ?status.missing_caps,
            "TUN capabilities incomplete, requesting setup"
        );
        let resp = self
            .helper
            .call(HelperRequest::tun_setup(binary))
            .await
            .map_err(|e| match e {
                VeaError::PrivilegedHelperUnavailable { reason, .. } => {
                    VeaError::PrivilegedHelperUnavailable {
                        reason,
                        hint: setup::manual_hint(binary),
                    }
                }
                other => other,
            })?;
        if !resp.is_success() {
            return Err(VeaError::PrivilegedHelperUnavailable {
                reason: format!("自动配置 TUN 权限失败: {}", resp.failure_message()),
                hint: setup::manual_hint(binary),
            });
        }

        let after = self.capabilities.status(Some(binary));
        if !after.usable() {
            return Err(VeaError::PrivilegedHelperUnavailable {
                reason: format!("自动配置后权限仍不完整: missingCaps={:?}", after.missing_caps),
                hint: setup::manual_hint(binary),
            });
        }
        info!(binary = %binary.display(), "TUN capabilities ready");
        Ok(())
    }

    pub fn snapshot(&self) -> InterfaceSnapshot {
        InterfaceSnapshot::capture(self.interfaces.as_ref())
    }

    pub async fn wait_ready(
        &self,
        expect: &TunExpectation,
        snapshot: &InterfaceSnapshot,
        done: &CancellationToken,
        policy: ReadyPolicy,
    ) -> Result<String> {
        iface::wait_ready(self.interfaces.as_ref(), expect, snapshot, done, policy).await
    }

    /// 旧接口在超时内消失返回 true
    pub async fn wait_absent(&self, name: &str, timeout: Duration) -> bool {
        iface::wait_absent(self.interfaces.as_ref(), name, timeout, ABSENT_POLL).await
    }

    /// 清理上次运行残留的 nftables/iptables/ip rule
    ///
    /// root 时直接执行；否则只在 helper 已运行时委托，不为清理单独弹授权。
    pub async fn cleanup_leftovers(&self) {
        if !cfg!(target_os = "linux") {
            return;
        }
        if platform::is_root() {
            if let Err(e) = tokio::task::spawn_blocking(cleanup::run_local_cleanup).await {
                warn!(error = %e, "TUN cleanup task failed");
            }
            return;
        }
        match self.helper.call_if_running(HelperRequest::tun_cleanup()).await {
            Some(resp) if !resp.is_success() => {
                warn!(error = %resp.failure_message(), "helper TUN cleanup failed")
            }
            _ => {}
        }
    }

    pub async fn kill_processes_using_config(&self, config_path: &Path) {
        let path = config_path.to_path_buf();
        if let Err(e) =
            tokio::task::spawn_blocking(move || cleanup::kill_processes_using_config(&path)).await
        {
            warn!(error = %e, "pkill task failed");
        }
    }
}

fn require_root(msg: &str) -> Result<()> {
    if platform::is_root() {
        Ok(())
    } else {
        Err(VeaError::TunNotConfigured(msg.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::helper::HelperResponse;

    /// 调用 tun-setup 后翻转权限状态的假 helper
    #[derive(Default)]
    pub struct FakeHelper {
        pub configured: Arc<AtomicBool>,
        pub setup_calls: AtomicUsize,
        pub cleanup_calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl PrivilegedHelper for FakeHelper {
        async fn call(&self, req: HelperRequest) -> Result<HelperResponse> {
            if self.fail {
                return Err(VeaError::PrivilegedHelperUnavailable {
                    reason: "pkexec not found".into(),
                    hint: String::new(),
                });
            }
            if req.op == "tun-setup" {
                self.setup_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.configured.store(true, Ordering::SeqCst);
            }
            Ok(HelperResponse::ok())
        }

        async fn call_if_running(&self, _req: HelperRequest) -> Option<HelperResponse> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    pub struct FlagCaps {
        pub configured: Arc<AtomicBool>,
    }

    impl CapabilityProbe for FlagCaps {
        fn status(&self, binary: Option<&Path>) -> TunCapabilityStatus {
            let ok = self.configured.load(Ordering::SeqCst);
            TunCapabilityStatus {
                platform: "linux".into(),
                user_exists: ok,
                binary_found: binary.is_some(),
                binary_path: binary.map(|b| b.display().to_string()).unwrap_or_default(),
                missing_caps: if ok {
                    Vec::new()
                } else {
                    vec!["cap_net_admin".into()]
                },
                fully_configured: ok,
                ..Default::default()
            }
        }
    }
}
