//! 用户侧 helper 客户端
//!
//! socket 不通时通过 [`HelperLauncher`]（默认 pkexec）拉起 helper。
//! 跨进程锁文件 `<socket>.lock` 保证同一时刻只弹出一次授权框，
//! 其余等待者轮询 `__ping` 直到 helper 就绪。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{HelperRequest, HelperResponse};
use crate::common::fsutil::look_path;
use crate::common::{platform, Result, VeaError};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
const PING_INTERVAL: Duration = Duration::from_millis(100);

const UNAVAILABLE_HINT: &str =
    "请确认已安装 polkit (pkexec) 并在授权窗口中确认，或手动运行: sudo ./vea setup-tun";

/// 以 root 执行白名单操作的通道
#[async_trait]
pub trait PrivilegedHelper: Send + Sync {
    /// 需要时拉起 helper
    async fn call(&self, req: HelperRequest) -> Result<HelperResponse>;

    /// 只在 helper 已运行时调用，从不弹授权框
    async fn call_if_running(&self, req: HelperRequest) -> Option<HelperResponse>;
}

/// 拉起 helper 进程（不等待就绪）
pub trait HelperLauncher: Send + Sync {
    fn launch(&self, socket: &Path, uid: u32, parent_pid: u32) -> anyhow::Result<()>;
}

/// `pkexec <vea> resolvectl-helper --socket … --uid … --parent-pid …`
pub struct PkexecLauncher {
    executable: PathBuf,
}

impl PkexecLauncher {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    /// 当前可执行文件（解析符号链接）
    pub fn current() -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("locate vea executable")?;
        Ok(Self::new(std::fs::canonicalize(&exe).unwrap_or(exe)))
    }
}

impl HelperLauncher for PkexecLauncher {
    fn launch(&self, socket: &Path, uid: u32, parent_pid: u32) -> anyhow::Result<()> {
        let pkexec = look_path("pkexec").ok_or_else(|| anyhow!("pkexec not found"))?;
        info!(executable = %self.executable.display(), "requesting privileges via pkexec");
        // 输出不能继承：shim 的 stdout 会被内核当作 resolvectl 的输出解析
        std::process::Command::new(pkexec)
            .arg(&self.executable)
            .arg("resolvectl-helper")
            .arg("--socket")
            .arg(socket)
            .arg("--uid")
            .arg(uid.to_string())
            .arg("--parent-pid")
            .arg(parent_pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("start resolvectl-helper via pkexec")?;
        Ok(())
    }
}

pub struct HelperClient {
    socket: PathBuf,
    launcher: Arc<dyn HelperLauncher>,
    uid: u32,
    parent_pid: u32,
    startup_timeout: Duration,
    /// 进程内串行化启动
    starting: tokio::sync::Mutex<()>,
}

impl HelperClient {
    pub fn new(socket: PathBuf, launcher: Arc<dyn HelperLauncher>) -> Self {
        Self {
            socket,
            launcher,
            uid: platform::current_uid(),
            parent_pid: std::process::id(),
            startup_timeout: STARTUP_TIMEOUT,
            starting: tokio::sync::Mutex::new(()),
        }
    }

    /// 覆盖 helper 的 socket 属主与被监视的父进程
    pub fn with_identity(mut self, uid: u32, parent_pid: u32) -> Self {
        self.uid = uid;
        self.parent_pid = parent_pid;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.socket.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn ping(&self) -> bool {
        send(&self.socket, &HelperRequest::ping())
            .await
            .map(|r| r.is_success())
            .unwrap_or(false)
    }

    async fn wait_ready(&self) -> bool {
        let deadline = Instant::now() + self.startup_timeout;
        while Instant::now() < deadline {
            if self.ping().await {
                return true;
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
        false
    }

    /// 确保 helper 在运行；最多触发一次 launcher
    pub async fn ensure_running(&self) -> Result<()> {
        let _guard = self.starting.lock().await;
        if self.ping().await {
            return Ok(());
        }

        let lock = self.lock_path();
        if let Some(dir) = lock.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock)
        {
            Ok(_) => {
                let res = self.launch_and_wait().await;
                let _ = std::fs::remove_file(&lock);
                res
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(lock = %lock.display(), "another process is starting the helper");
                if self.wait_ready().await {
                    return Ok(());
                }
                if lock_is_stale(&lock, self.startup_timeout) {
                    warn!(lock = %lock.display(), "removing stale helper lock");
                    let _ = std::fs::remove_file(&lock);
                }
                Err(unavailable("timeout waiting for helper started by another process"))
            }
            Err(e) => Err(unavailable(format!("create helper lock: {}", e))),
        }
    }

    async fn launch_and_wait(&self) -> Result<()> {
        self.launcher
            .launch(&self.socket, self.uid, self.parent_pid)
            .map_err(|e| unavailable(format!("{:#}", e)))?;
        if self.wait_ready().await {
            info!(socket = %self.socket.display(), "privileged helper ready");
            Ok(())
        } else {
            Err(unavailable("helper not ready in time"))
        }
    }
}

#[async_trait]
impl PrivilegedHelper for HelperClient {
    async fn call(&self, req: HelperRequest) -> Result<HelperResponse> {
        if let Ok(resp) = send(&self.socket, &req).await {
            return Ok(resp);
        }
        self.ensure_running().await?;
        send(&self.socket, &req)
            .await
            .map_err(|e| unavailable(format!("{:#}", e)))
    }

    async fn call_if_running(&self, req: HelperRequest) -> Option<HelperResponse> {
        match send(&self.socket, &req).await {
            Ok(resp) => Some(resp),
            Err(e) => {
                debug!(error = %e, "helper not running");
                None
            }
        }
    }
}

fn unavailable(reason: impl Into<String>) -> VeaError {
    VeaError::PrivilegedHelperUnavailable {
        reason: reason.into(),
        hint: UNAVAILABLE_HINT.to_string(),
    }
}

fn lock_is_stale(lock: &Path, age: Duration) -> bool {
    std::fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|elapsed| elapsed >= age)
        .unwrap_or(false)
}

/// 一次请求一条连接
#[cfg(unix)]
pub async fn send(socket: &Path, req: &HelperRequest) -> anyhow::Result<HelperResponse> {
    use super::protocol::{read_message, write_message};

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::UnixStream::connect(socket))
        .await
        .map_err(|_| anyhow!("connect {}: timed out", socket.display()))?
        .with_context(|| format!("connect {}", socket.display()))?;

    let exchange = async {
        let (read_half, mut write_half) = stream.into_split();
        write_message(&mut write_half, req).await?;
        let mut reader = tokio::io::BufReader::new(read_half);
        read_message::<HelperResponse, _>(&mut reader)
            .await?
            .ok_or_else(|| anyhow!("helper closed connection without response"))
    };
    tokio::time::timeout(REQUEST_DEADLINE, exchange)
        .await
        .map_err(|_| anyhow!("helper request timed out"))?
}

#[cfg(not(unix))]
pub async fn send(_socket: &Path, _req: &HelperRequest) -> anyhow::Result<HelperResponse> {
    Err(anyhow!("privileged helper is only available on Linux"))
}

/// 非 Linux 平台的占位：进程本身必须已有 root/管理员权限
pub struct NoHelper;

#[async_trait]
impl PrivilegedHelper for NoHelper {
    async fn call(&self, _req: HelperRequest) -> Result<HelperResponse> {
        Err(VeaError::PrivilegedHelperUnavailable {
            reason: "privileged helper is only available on Linux".into(),
            hint: "请以 root/管理员身份运行 vea".into(),
        })
    }

    async fn call_if_running(&self, _req: HelperRequest) -> Option<HelperResponse> {
        None
    }
}

/// 按平台选择默认实现
pub fn default_helper(socket: PathBuf) -> anyhow::Result<Arc<dyn PrivilegedHelper>> {
    if cfg!(target_os = "linux") {
        let launcher = PkexecLauncher::current()?;
        Ok(Arc::new(HelperClient::new(socket, Arc::new(launcher))))
    } else {
        Ok(Arc::new(NoHelper))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
