//! root 侧 helper 进程
//!
//! 由 `vea resolvectl-helper` 子命令在 pkexec 下运行：监听 Unix socket，
//! 每个连接处理一条请求；父进程消失后退出并删除 socket。

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    artifacts_root_from_socket, read_message, validate_setup_binary, write_message, HelperOp,
    HelperRequest, HelperResponse,
};
use super::real_resolvectl;
use crate::common::platform;

/// 单个连接的最长处理时间
const CONN_DEADLINE: Duration = Duration::from_secs(30);

/// 父进程存活检查间隔
const PARENT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HelperServerConfig {
    pub socket: PathBuf,
    /// socket 文件属主
    pub uid: u32,
    /// 0 表示不监视
    pub parent_pid: u32,
}

/// helper 真正执行的系统操作；测试用假实现替换
#[async_trait]
pub trait OpExecutor: Send + Sync {
    async fn resolvectl(&self, args: &[String]) -> HelperResponse;

    /// `binary` 已经过路径白名单校验
    async fn tun_setup(&self, binary: &Path) -> HelperResponse;

    async fn tun_cleanup(&self) -> HelperResponse;
}

/// 以 root 身份执行真实命令
pub struct SystemExecutor;

#[async_trait]
impl OpExecutor for SystemExecutor {
    async fn resolvectl(&self, args: &[String]) -> HelperResponse {
        let program = real_resolvectl();
        let output = tokio::process::Command::new(&program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) => HelperResponse {
                exit_code: out.status.code().unwrap_or(1),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                error: String::new(),
            },
            Err(e) => HelperResponse::failure(format!("exec {}: {}", program.display(), e)),
        }
    }

    async fn tun_setup(&self, binary: &Path) -> HelperResponse {
        let binary = binary.to_path_buf();
        let res = tokio::task::spawn_blocking(move || crate::tun::setup::setup_tun_binary(&binary))
            .await;
        match res {
            Ok(Ok(())) => HelperResponse::ok(),
            Ok(Err(e)) => HelperResponse::failure(format!("{:#}", e)),
            Err(e) => HelperResponse::failure(format!("setup task: {}", e)),
        }
    }

    async fn tun_cleanup(&self) -> HelperResponse {
        let res = tokio::task::spawn_blocking(crate::tun::cleanup::run_local_cleanup).await;
        match res {
            Ok(()) => HelperResponse::ok(),
            Err(e) => HelperResponse::failure(format!("cleanup task: {}", e)),
        }
    }
}

/// helper 主循环；监视父进程，父进程退出即返回
pub async fn run_helper(cfg: HelperServerConfig, executor: Arc<dyn OpExecutor>) -> anyhow::Result<()> {
    if !platform::is_root() {
        bail!("resolvectl-helper requires root privileges");
    }
    let shutdown = CancellationToken::new();
    if cfg.parent_pid > 0 {
        tokio::spawn(watch_parent(cfg.parent_pid, shutdown.clone()));
    }
    serve(cfg, executor, shutdown).await
}

async fn watch_parent(pid: u32, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PARENT_POLL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        if pid > 1 && !platform::pid_alive(pid) {
            info!(parent_pid = pid, "parent process gone, helper exiting");
            shutdown.cancel();
            return;
        }
    }
}

/// 在 socket 上服务直到 `shutdown` 被取消
pub async fn serve(
    cfg: HelperServerConfig,
    executor: Arc<dyn OpExecutor>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let root = artifacts_root_from_socket(&cfg.socket)?;
    let listener = bind_socket(&cfg.socket, cfg.uid)?;
    info!(socket = %cfg.socket.display(), uid = cfg.uid, "privileged helper listening");

    let root = Arc::new(root);
    let result = loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let executor = executor.clone();
                let root = root.clone();
                tokio::spawn(async move {
                    let handled =
                        tokio::time::timeout(CONN_DEADLINE, handle_conn(stream, &root, executor))
                            .await;
                    match handled {
                        Ok(Err(e)) => debug!(error = %e, "helper connection failed"),
                        Err(_) => debug!("helper connection timed out"),
                        Ok(Ok(())) => {}
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "helper accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };

    drop(listener);
    let _ = std::fs::remove_file(&cfg.socket);
    debug!(socket = %cfg.socket.display(), "privileged helper stopped");
    result
}

fn bind_socket(socket: &Path, uid: u32) -> anyhow::Result<UnixListener> {
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create socket dir {}", dir.display()))?;
    }
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket)
        .with_context(|| format!("listen unix socket {}", socket.display()))?;
    std::os::unix::fs::chown(socket, Some(uid), None).context("chown socket")?;
    std::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o600))
        .context("chmod socket")?;
    Ok(listener)
}

async fn handle_conn(
    stream: UnixStream,
    root: &Path,
    executor: Arc<dyn OpExecutor>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let resp = match read_message::<HelperRequest, _>(&mut reader).await {
        Ok(Some(req)) => dispatch(&req, root, executor.as_ref()).await,
        Ok(None) => return Ok(()),
        Err(e) => HelperResponse::failure(format!("decode request: {:#}", e)),
    };
    write_message(&mut write_half, &resp).await
}

/// 校验并执行一条请求
pub async fn dispatch(req: &HelperRequest, root: &Path, executor: &dyn OpExecutor) -> HelperResponse {
    let op = match HelperOp::parse(req) {
        Ok(op) => op,
        Err(msg) => {
            warn!(op = %req.op, error = %msg, "helper request rejected");
            return HelperResponse::failure(msg);
        }
    };
    match op {
        HelperOp::Ping => HelperResponse::ok(),
        HelperOp::Resolvectl(args) => executor.resolvectl(&args).await,
        HelperOp::TunSetup(path) => match validate_setup_binary(root, &path) {
            Ok(binary) => {
                info!(binary = %binary.display(), "helper running tun setup");
                executor.tun_setup(&binary).await
            }
            Err(e) => {
                warn!(binary = %path, error = %e, "helper rejected tun setup path");
                HelperResponse::failure(format!("{:#}", e))
            }
        },
        HelperOp::TunCleanup => executor.tun_cleanup().await,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OpExecutor for Recorder {
        async fn resolvectl(&self, args: &[String]) -> HelperResponse {
            self.calls.lock().unwrap().push(args.join(" "));
            HelperResponse {
                stdout: "ok\n".into(),
                ..Default::default()
            }
        }
        async fn tun_setup(&self, binary: &Path) -> HelperResponse {
            self.calls
                .lock()
                .unwrap()
                .push(format!("setup {}", binary.display()));
            HelperResponse::ok()
        }
        async fn tun_cleanup(&self) -> HelperResponse {
            self.calls.lock().unwrap().push("cleanup".into());
            HelperResponse::ok()
        }
    }

    #[tokio::test]
    async fn rejected_ops_never_reach_executor() {
        let rec = Recorder::default();
        let root = Path::new("/nonexistent/artifacts");
        for req in [
            HelperRequest {
                op: "exec".into(),
                args: vec!["sh".into()],
                ..Default::default()
            },
            HelperRequest::resolvectl(vec!["status".into()]),
            HelperRequest::resolvectl(vec!["--help".into()]),
            HelperRequest::tun_setup(Path::new("/usr/bin/sh")),
        ] {
            let resp = dispatch(&req, root, &rec).await;
            assert_eq!(resp.exit_code, 1, "{:?}", req);
            assert!(!resp.error.is_empty());
        }
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn allowed_ops_are_forwarded() {
        let rec = Recorder::default();
        let root = Path::new("/nonexistent/artifacts");
        let resp = dispatch(
            &HelperRequest::resolvectl(vec!["dns".into(), "tun0".into(), "1.1.1.1".into()]),
            root,
            &rec,
        )
        .await;
        assert_eq!(resp.stdout, "ok\n");
        let resp = dispatch(&HelperRequest::ping(), root, &rec).await;
        assert!(resp.is_success());
        dispatch(&HelperRequest::tun_cleanup(), root, &rec).await;
        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec!["dns tun0 1.1.1.1".to_string(), "cleanup".to_string()]
        );
    }

    #[tokio::test]
    async fn socket_is_private_and_removed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("runtime").join("resolvectl-helper.sock");
        let cfg = HelperServerConfig {
            socket: socket.clone(),
            uid: platform::current_uid(),
            parent_pid: 0,
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(cfg, Arc::new(Recorder::default()), shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !socket.exists() {
            assert!(tokio::time::Instant::now() < deadline, "socket never appeared");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mode = std::fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn wrong_socket_name_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HelperServerConfig {
            socket: dir.path().join("helper.sock"),
            uid: platform::current_uid(),
            parent_pid: 0,
        };
        let err = serve(cfg, Arc::new(Recorder::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("runtime/"));
    }
}
