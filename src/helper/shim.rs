//! PATH 中的 `resolvectl` 替身
//!
//! 内核以普通用户运行时调用 resolvectl 会失败，替身脚本把调用转给
//! `vea resolvectl-shim`，再经 helper socket 以 root 执行。

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use super::client::{HelperClient, PkexecLauncher, PrivilegedHelper};
use super::protocol::HelperRequest;
use super::real_resolvectl;
use crate::common::fsutil::{set_mode, write_atomic};

pub const ENV_EXECUTABLE: &str = "VEA_EXECUTABLE";
pub const ENV_SOCKET: &str = "VEA_RESOLVECTL_SOCKET";
pub const ENV_UID: &str = "VEA_RESOLVECTL_UID";
pub const ENV_PARENT_PID: &str = "VEA_RESOLVECTL_PARENT_PID";

const SHIM_SCRIPT: &str = r#"#!/bin/sh
set -eu

if [ -n "${VEA_EXECUTABLE:-}" ]; then
  exec "${VEA_EXECUTABLE}" resolvectl-shim "$@"
fi

exec /usr/bin/resolvectl "$@"
"#;

/// 写出 `<dir>/resolvectl`，内容相同则不动
pub fn ensure_shim(dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create shim dir {}", dir.display()))?;
    let path = dir.join("resolvectl");
    let current = std::fs::read(&path).ok();
    if current.as_deref() != Some(SHIM_SCRIPT.as_bytes()) {
        write_atomic(&path, SHIM_SCRIPT.as_bytes())?;
        debug!(path = %path.display(), "resolvectl shim written");
    }
    set_mode(&path, 0o755).context("chmod shim")?;
    Ok(path)
}

/// 注入内核进程的环境变量
pub fn shim_env(executable: &Path, socket: &Path, uid: u32, parent_pid: u32) -> Vec<(String, String)> {
    vec![
        (ENV_EXECUTABLE.to_string(), executable.to_string_lossy().into_owned()),
        (ENV_SOCKET.to_string(), socket.to_string_lossy().into_owned()),
        (ENV_UID.to_string(), uid.to_string()),
        (ENV_PARENT_PID.to_string(), parent_pid.to_string()),
    ]
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `vea resolvectl-shim` 入口，返回进程退出码
///
/// 输出必须与真实 resolvectl 一致，因此直接写 stdout/stderr 而不经 tracing。
pub async fn run_shim(args: Vec<String>) -> i32 {
    let Some(socket) = env_trimmed(ENV_SOCKET) else {
        return exec_real(&args);
    };

    let launcher = match env_trimmed(ENV_EXECUTABLE) {
        Some(exe) => PkexecLauncher::new(std::fs::canonicalize(&exe).unwrap_or_else(|_| exe.into())),
        None => match PkexecLauncher::current() {
            Ok(l) => l,
            Err(_) => return exec_real(&args),
        },
    };
    let mut client = HelperClient::new(PathBuf::from(socket), Arc::new(launcher));
    let uid = env_trimmed(ENV_UID).and_then(|v| v.parse().ok());
    let parent = env_trimmed(ENV_PARENT_PID).and_then(|v| v.parse().ok());
    if let (Some(uid), Some(parent)) = (uid, parent) {
        client = client.with_identity(uid, parent);
    }

    let resp = match client.call(HelperRequest::resolvectl(args.clone())).await {
        Ok(resp) => resp,
        Err(_) => return exec_real(&args),
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    if !resp.stdout.is_empty() {
        let _ = stdout.write_all(resp.stdout.as_bytes());
        let _ = stdout.flush();
    }
    if !resp.stderr.is_empty() {
        let _ = stderr.write_all(resp.stderr.as_bytes());
    }
    if !resp.error.is_empty() && resp.exit_code == 0 {
        let _ = writeln!(stderr, "{}", resp.error);
        return 1;
    }
    resp.exit_code
}

/// 直接执行系统 resolvectl，继承标准流
fn exec_real(args: &[String]) -> i32 {
    match std::process::Command::new(real_resolvectl()).args(args).status() {
        Ok(status) => status.code().unwrap_or(1),
        Err(_) => 1,
    }
}
