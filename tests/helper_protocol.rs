//! 特权 helper 线协议集成测试：白名单、路径校验、畸形输入与 socket 生命周期
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use vea::common::platform;
use vea::helper::client::send;
use vea::helper::server::{serve, HelperServerConfig, OpExecutor};
use vea::helper::{HelperRequest, HelperResponse};

#[derive(Default)]
struct Recorder {
    resolvectl: Mutex<Vec<Vec<String>>>,
    setups: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl OpExecutor for Recorder {
    async fn resolvectl(&self, args: &[String]) -> HelperResponse {
        self.resolvectl.lock().unwrap().push(args.to_vec());
        HelperResponse {
            stdout: "Link 7 (tun0): 172.19.0.2\n".into(),
            ..Default::default()
        }
    }

    async fn tun_setup(&self, binary: &Path) -> HelperResponse {
        self.setups.lock().unwrap().push(binary.to_path_buf());
        HelperResponse::ok()
    }

    async fn tun_cleanup(&self) -> HelperResponse {
        HelperResponse::ok()
    }
}

struct Running {
    root: tempfile::TempDir,
    socket: PathBuf,
    recorder: Arc<Recorder>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_helper() -> Running {
    let root = tempfile::tempdir().unwrap();
    let socket = root.path().join("runtime").join("resolvectl-helper.sock");
    let recorder = Arc::new(Recorder::default());
    let shutdown = CancellationToken::new();
    let cfg = HelperServerConfig {
        socket: socket.clone(),
        uid: platform::current_uid(),
        parent_pid: 0,
    };
    let task = tokio::spawn(serve(cfg, recorder.clone(), shutdown.clone()));

    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Running {
        root,
        socket,
        recorder,
        shutdown,
        task,
    }
}

fn resolvectl(args: &[&str]) -> HelperRequest {
    HelperRequest::resolvectl(args.iter().map(|s| s.to_string()).collect())
}

#[tokio::test]
async fn allowed_verbs_reach_executor() {
    let h = start_helper().await;

    let resp = send(&h.socket, &resolvectl(&["dns", "tun0", "172.19.0.2"]))
        .await
        .unwrap();
    assert!(resp.is_success());
    assert!(resp.stdout.contains("tun0"));

    let ping = send(&h.socket, &HelperRequest::ping()).await.unwrap();
    assert!(ping.is_success());

    let seen = h.recorder.resolvectl.lock().unwrap().clone();
    assert_eq!(seen, vec![vec!["dns", "tun0", "172.19.0.2"]]);
    h.shutdown.cancel();
}

#[tokio::test]
async fn options_and_unknown_verbs_are_rejected() {
    let h = start_helper().await;

    for args in [
        &["dns", "--interface", "tun0"][..],
        &["-h"][..],
        &["flush-caches"][..],
    ] {
        let resp = send(&h.socket, &resolvectl(args)).await.unwrap();
        assert!(!resp.is_success(), "{:?} should be rejected", args);
        assert!(!resp.error.is_empty());
    }

    let unknown = HelperRequest {
        op: "exec".into(),
        args: vec!["/bin/sh".into()],
        ..Default::default()
    };
    let resp = send(&h.socket, &unknown).await.unwrap();
    assert!(resp.failure_message().contains("unsupported op"));

    assert!(h.recorder.resolvectl.lock().unwrap().is_empty());
    h.shutdown.cancel();
}

#[tokio::test]
async fn tun_setup_only_accepts_installed_kernels() {
    let h = start_helper().await;

    let core = h.root.path().join("core").join("sing-box");
    std::fs::create_dir_all(&core).unwrap();
    let inside = core.join("sing-box");
    std::fs::write(&inside, b"").unwrap();

    let outside_dir = h.root.path().join("elsewhere");
    std::fs::create_dir_all(&outside_dir).unwrap();
    let outside = outside_dir.join("sing-box");
    std::fs::write(&outside, b"").unwrap();

    let wrong_name = core.join("bash");
    std::fs::write(&wrong_name, b"").unwrap();

    let ok = send(&h.socket, &HelperRequest::tun_setup(&inside))
        .await
        .unwrap();
    assert!(ok.is_success(), "{}", ok.failure_message());

    for rejected in [&outside, &wrong_name] {
        let resp = send(&h.socket, &HelperRequest::tun_setup(rejected))
            .await
            .unwrap();
        assert!(!resp.is_success());
    }

    let setups = h.recorder.setups.lock().unwrap().clone();
    assert_eq!(setups, vec![std::fs::canonicalize(&inside).unwrap()]);
    h.shutdown.cancel();
}

#[tokio::test]
async fn malformed_request_gets_error_response() {
    let h = start_helper().await;

    let stream = UnixStream::connect(&h.socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"{not json\n").await.unwrap();

    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await.unwrap();
    let resp: HelperResponse = serde_json::from_str(&line).unwrap();
    assert_eq!(resp.exit_code, 1);
    assert!(resp.error.contains("decode request"));
    h.shutdown.cancel();
}

#[tokio::test]
async fn socket_is_private_and_removed_on_shutdown() {
    let h = start_helper().await;

    let mode = std::fs::metadata(&h.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    h.shutdown.cancel();
    h.task.await.unwrap().unwrap();
    assert!(!h.socket.exists());
}
