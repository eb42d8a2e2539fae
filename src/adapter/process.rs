//! 内核子进程：启动、输出扇出、回收、停止与端口就绪探测
//!
//! 每个子进程由一个回收任务独占 `Child`，退出后取消 `done`；
//! 其它任何地方只通过 `ProcessHandle` 观察或请求终止。

use std::fs::File;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Result, VeaError};

/// 内核日志文件；`None` 表示已关闭
pub type LogSink = Arc<Mutex<Option<File>>>;

pub fn log_sink(file: File) -> LogSink {
    Arc::new(Mutex::new(Some(file)))
}

/// 启动参数
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub binary_path: PathBuf,
    /// 工作目录
    pub config_dir: PathBuf,
    /// 覆盖的环境变量
    pub env: Vec<(String, String)>,
    /// 依次插到 PATH 最前面
    pub path_prepend: Vec<PathBuf>,
    pub log: Option<LogSink>,
    /// 就绪探测端口，0 表示不探测
    pub port: u16,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub struct ProcessHandle {
    /// 进程内唯一，用于判断"当前句柄是否还是这一个"
    pub id: u64,
    pub pid: Option<u32>,
    pub config_path: PathBuf,
    pub binary_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub port: u16,
    log: Option<LogSink>,
    done: CancellationToken,
    kill: Arc<Notify>,
    exit_code: Arc<OnceLock<Option<i32>>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("config_path", &self.config_path)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProcessHandle {
    pub fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// 进程退出后返回
    pub async fn exited(&self) {
        self.done.cancelled().await
    }

    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// 被信号杀死时为 None
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied().flatten()
    }

    pub fn close_log(&self) {
        if let Some(sink) = &self.log {
            if let Ok(mut guard) = sink.lock() {
                if let Some(mut f) = guard.take() {
                    let _ = f.flush();
                }
            }
        }
    }

    /// 请求回收任务强杀
    pub fn force_kill(&self) {
        self.kill.notify_one();
    }
}

/// 启动子进程，不等待就绪
pub fn spawn(cfg: &ProcessConfig, args: &[String], config_path: &Path) -> Result<Arc<ProcessHandle>> {
    let mut cmd = Command::new(&cfg.binary_path);
    cmd.args(args)
        .current_dir(&cfg.config_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in &cfg.env {
        cmd.env(k, v);
    }
    if !cfg.path_prepend.is_empty() {
        let existing = std::env::var_os("PATH").unwrap_or_default();
        let joined = std::env::join_paths(
            cfg.path_prepend
                .iter()
                .cloned()
                .chain(std::env::split_paths(&existing)),
        )
        .map_err(|e| VeaError::SpawnError(format!("build PATH: {}", e)))?;
        cmd.env("PATH", joined);
    }
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd.spawn().map_err(|e| {
        VeaError::SpawnError(format!("{}: {}", cfg.binary_path.display(), e))
    })?;
    let pid = child.id();

    if let Some(out) = child.stdout.take() {
        tokio::spawn(pump(out, cfg.log.clone(), false));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(pump(err, cfg.log.clone(), true));
    }

    let handle = Arc::new(ProcessHandle {
        id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
        pid,
        config_path: config_path.to_path_buf(),
        binary_path: cfg.binary_path.clone(),
        started_at: Utc::now(),
        port: cfg.port,
        log: cfg.log.clone(),
        done: CancellationToken::new(),
        kill: Arc::new(Notify::new()),
        exit_code: Arc::new(OnceLock::new()),
    });

    tokio::spawn(reap(
        child,
        handle.kill.clone(),
        handle.done.clone(),
        handle.exit_code.clone(),
    ));

    debug!(pid = ?pid, binary = %cfg.binary_path.display(), "kernel process spawned");
    Ok(handle)
}

async fn reap(
    mut child: Child,
    kill: Arc<Notify>,
    done: CancellationToken,
    exit_code: Arc<OnceLock<Option<i32>>>,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.notified() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = status.ok().and_then(|s| s.code());
    let _ = exit_code.set(code);
    debug!(pid = ?pid, code = ?code, "kernel process exited");
    done.cancel();
}

/// 把子进程输出同时写入日志文件与宿主的 stdout/stderr
async fn pump<R: AsyncRead + Unpin>(mut reader: R, log: Option<LogSink>, to_stderr: bool) {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];
        if let Some(sink) = &log {
            if let Ok(mut guard) = sink.lock() {
                if let Some(f) = guard.as_mut() {
                    let _ = f.write_all(chunk);
                }
            }
        }
        if to_stderr {
            let _ = tokio::io::stderr().write_all(chunk).await;
        } else {
            let _ = tokio::io::stdout().write_all(chunk).await;
        }
    }
}

/// 优雅停止：SIGTERM（Windows 直接 kill），超时后强杀
///
/// 带 auto_route 的内核需要在退出时清理路由，强杀会在下次启动时留下 "device or resource busy"。
pub async fn terminate(handle: &ProcessHandle, grace: Duration) {
    if !handle.is_running() {
        return;
    }

    #[cfg(unix)]
    {
        match handle.pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
            Some(pid) => {
                // SAFETY: 向自己启动且尚未回收的子进程发信号
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }
            None => handle.force_kill(),
        }
    }
    #[cfg(not(unix))]
    handle.force_kill();

    if tokio::time::timeout(grace, handle.exited()).await.is_ok() {
        return;
    }
    warn!(pid = ?handle.pid, grace = ?grace, "kernel ignored SIGTERM, killing");
    handle.force_kill();
    let _ = tokio::time::timeout(Duration::from_secs(3), handle.exited()).await;
}

/// 用 listen 探测端口是否已被占用
///
/// 不用 connect：部分内核在 debug 日志下会为每次探测连接记录一条 inbound + EOF。
pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    match socket.bind(&addr.into()).and_then(|_| socket.listen(1)) {
        Ok(()) => {
            #[cfg(windows)]
            {
                // Windows 允许在 0.0.0.0 已被监听时绑定更具体的地址
                drop(socket);
                return std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200))
                    .is_ok();
            }
            #[cfg(not(windows))]
            false
        }
        Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
    }
}

/// 等待端口被监听；进程提前退出时立即失败
pub async fn wait_for_port(handle: &ProcessHandle, timeout: Duration) -> Result<()> {
    if handle.port == 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = handle.exited() => {}
        }
        return if handle.is_running() {
            Ok(())
        } else {
            Err(VeaError::KernelExitedBeforeReady)
        };
    }

    let deadline = Instant::now() + timeout;
    loop {
        if !handle.is_running() {
            return Err(VeaError::KernelExitedBeforeReady);
        }
        if port_in_use(handle.port) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(VeaError::ProcessNotReady(format!(
                "port {} not listening after {:?}",
                handle.port, timeout
            )));
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = handle.exited() => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
