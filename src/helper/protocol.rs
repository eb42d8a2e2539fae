//! 特权 helper 的线上协议
//!
//! 一行一条 JSON 消息，单条不超过 1 MiB。请求 `{op, args, binaryPath}`，
//! 响应 `{exitCode, stdout, stderr, error}`。

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::paths::HELPER_SOCKET_NAME;

/// 单条消息上限
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

pub const OP_RESOLVECTL: &str = "resolvectl";
pub const OP_TUN_SETUP: &str = "tun-setup";
pub const OP_TUN_CLEANUP: &str = "tun-cleanup";

/// 存活探测，不执行任何命令
pub const PING_ARG: &str = "__ping";

/// 允许转发给 resolvectl 的子命令
const RESOLVECTL_VERBS: &[&str] = &["dns", "domain", "default-route", "revert", PING_ARG];

/// `tun-setup` 只接受这些可执行文件名
const SETUP_BINARY_NAMES: &[&str] = &["sing-box", "mihomo", "clash"];

/// `tun-setup` 的二进制只能位于这些 core 子目录下
const SETUP_BINARY_DIRS: &[&str] = &["sing-box", "clash"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelperRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub binary_path: String,
}

impl HelperRequest {
    pub fn ping() -> Self {
        Self::resolvectl(vec![PING_ARG.to_string()])
    }

    pub fn resolvectl(args: Vec<String>) -> Self {
        Self {
            op: OP_RESOLVECTL.to_string(),
            args,
            ..Default::default()
        }
    }

    pub fn tun_setup(binary: &Path) -> Self {
        Self {
            op: OP_TUN_SETUP.to_string(),
            binary_path: binary.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    pub fn tun_cleanup() -> Self {
        Self {
            op: OP_TUN_CLEANUP.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelperResponse {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl HelperResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: msg.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_empty()
    }

    /// 失败时给出可读说明
    pub fn failure_message(&self) -> String {
        if !self.error.is_empty() {
            return self.error.clone();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        format!("exit code {}", self.exit_code)
    }
}

/// 经白名单校验后的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperOp {
    Ping,
    Resolvectl(Vec<String>),
    TunSetup(String),
    TunCleanup,
}

impl HelperOp {
    /// 白名单之外的请求一律拒绝，返回值直接作为响应的 error
    pub fn parse(req: &HelperRequest) -> Result<Self, String> {
        match req.op.trim() {
            "" | OP_RESOLVECTL => parse_resolvectl(&req.args),
            OP_TUN_SETUP => {
                let path = req.binary_path.trim();
                if path.is_empty() {
                    return Err("binaryPath is required".to_string());
                }
                Ok(HelperOp::TunSetup(path.to_string()))
            }
            OP_TUN_CLEANUP => Ok(HelperOp::TunCleanup),
            other => Err(format!("unsupported op: {}", other)),
        }
    }
}

fn parse_resolvectl(args: &[String]) -> Result<HelperOp, String> {
    let Some(head) = args.first() else {
        return Err("missing args".to_string());
    };
    if args.iter().any(|a| a.starts_with('-')) {
        return Err("options are not allowed".to_string());
    }
    if !RESOLVECTL_VERBS.contains(&head.as_str()) {
        return Err(format!("command not allowed: {}", head));
    }
    if head == PING_ARG {
        return Ok(HelperOp::Ping);
    }
    Ok(HelperOp::Resolvectl(args.to_vec()))
}

// ─── 路径校验 ───

/// 从 socket 路径反推 artifacts 根目录
///
/// socket 必须是 `<root>/runtime/resolvectl-helper.sock`，否则 helper 拒绝启动。
pub fn artifacts_root_from_socket(socket: &Path) -> anyhow::Result<PathBuf> {
    let abs = absolutize(socket)?;
    let name_ok = abs.file_name().and_then(|n| n.to_str()) == Some(HELPER_SOCKET_NAME);
    let runtime = abs.parent();
    let runtime_ok = runtime
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        == Some("runtime");
    if !name_ok || !runtime_ok {
        bail!(
            "socket path must end with runtime/{}: {}",
            HELPER_SOCKET_NAME,
            abs.display()
        );
    }
    runtime
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("socket path has no artifacts root: {}", abs.display()))
}

/// 校验 `tun-setup` 的目标二进制，返回解析符号链接后的绝对路径
pub fn validate_setup_binary(artifacts_root: &Path, binary: &str) -> anyhow::Result<PathBuf> {
    let resolved = std::fs::canonicalize(binary)
        .with_context(|| format!("resolve binary path {}", binary))?;
    let root = std::fs::canonicalize(artifacts_root)
        .or_else(|_| absolutize(artifacts_root))
        .context("resolve artifacts root")?;

    let under_core = SETUP_BINARY_DIRS
        .iter()
        .map(|d| root.join("core").join(d))
        .any(|dir| resolved.starts_with(&dir) && resolved != dir);
    if !under_core {
        bail!(
            "binary must live under {}/core/{{sing-box,clash}}: {}",
            root.display(),
            resolved.display()
        );
    }

    let name = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if !SETUP_BINARY_NAMES.contains(&name) {
        bail!("binary name not allowed: {}", name);
    }
    Ok(resolved)
}

fn absolutize(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("current dir")?
        .join(path))
}

// ─── 编解码 ───

/// 读取一条消息；对端在消息开始前关闭连接时返回 `None`
pub async fn read_message<T, R>(reader: &mut R) -> anyhow::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = (MAX_MESSAGE_BYTES + 1) as u64;
    let n = reader
        .take(limit)
        .read_until(b'\n', &mut line)
        .await
        .context("read message")?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_MESSAGE_BYTES {
        bail!("message exceeds {} bytes", MAX_MESSAGE_BYTES);
    }
    let msg = serde_json::from_slice(&line).context("decode message")?;
    Ok(Some(msg))
}

pub async fn write_message<T, W>(writer: &mut W, msg: &T) -> anyhow::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(msg).context("encode message")?;
    if buf.len() >= MAX_MESSAGE_BYTES {
        bail!("message exceeds {} bytes", MAX_MESSAGE_BYTES);
    }
    buf.push(b'\n');
    writer.write_all(&buf).await.context("write message")?;
    writer.flush().await.context("flush message")?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn req(op: &str, args: &[&str]) -> HelperRequest {
        HelperRequest {
            op: op.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            binary_path: String::new(),
        }
    }

    #[test]
    fn whitelist_accepts_known_verbs() {
        assert_eq!(HelperOp::parse(&req("", &["__ping"])), Ok(HelperOp::Ping));
        assert_eq!(
            HelperOp::parse(&req("resolvectl", &["dns", "tun0", "172.19.0.2"])),
            Ok(HelperOp::Resolvectl(vec![
                "dns".into(),
                "tun0".into(),
                "172.19.0.2".into()
            ]))
        );
        assert_eq!(
            HelperOp::parse(&req("tun-cleanup", &[])),
            Ok(HelperOp::TunCleanup)
        );
    }

    #[test]
    fn whitelist_rejects_everything_else() {
        assert!(HelperOp::parse(&req("", &["status"])).is_err());
        assert!(HelperOp::parse(&req("", &[])).is_err());
        assert!(HelperOp::parse(&req("exec", &["sh"])).is_err());
        assert_eq!(
            HelperOp::parse(&req("", &["dns", "--interface=tun0"])),
            Err("options are not allowed".to_string())
        );
        assert_eq!(
            HelperOp::parse(&req("", &["-h"])),
            Err("options are not allowed".to_string())
        );
        assert!(HelperOp::parse(&req("tun-setup", &[])).is_err());
    }

    #[test]
    fn wire_names_are_camel_case() {
        let r = HelperRequest::tun_setup(Path::new("/a/sing-box"));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["op"], "tun-setup");
        assert_eq!(json["binaryPath"], "/a/sing-box");
        assert!(json.get("args").is_none());

        let resp: HelperResponse =
            serde_json::from_str(r#"{"exitCode":2,"stderr":"boom"}"#).unwrap();
        assert_eq!(resp.exit_code, 2);
        assert_eq!(resp.failure_message(), "boom");
        assert!(!resp.is_success());
    }

    #[test]
    fn socket_path_determines_root() {
        let root = artifacts_root_from_socket(Path::new(
            "/opt/vea/artifacts/runtime/resolvectl-helper.sock",
        ))
        .unwrap();
        assert_eq!(root, PathBuf::from("/opt/vea/artifacts"));

        assert!(artifacts_root_from_socket(Path::new("/tmp/helper.sock")).is_err());
        assert!(
            artifacts_root_from_socket(Path::new("/tmp/other/resolvectl-helper.sock")).is_err()
        );
    }

    #[test]
    fn setup_binary_must_be_under_core() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let sb_dir = root.join("core").join("sing-box");
        std::fs::create_dir_all(&sb_dir).unwrap();
        let good = sb_dir.join("sing-box");
        std::fs::write(&good, b"bin").unwrap();
        let bad_name = sb_dir.join("sh");
        std::fs::write(&bad_name, b"bin").unwrap();
        let xray_dir = root.join("core").join("xray");
        std::fs::create_dir_all(&xray_dir).unwrap();
        let wrong_dir = xray_dir.join("sing-box");
        std::fs::write(&wrong_dir, b"bin").unwrap();

        let ok = validate_setup_binary(root, good.to_str().unwrap()).unwrap();
        assert!(ok.ends_with("core/sing-box/sing-box"));
        assert!(validate_setup_binary(root, bad_name.to_str().unwrap()).is_err());
        assert!(validate_setup_binary(root, wrong_dir.to_str().unwrap()).is_err());
        assert!(validate_setup_binary(root, "/usr/bin/sh").is_err());
        assert!(validate_setup_binary(root, "/does/not/exist/sing-box").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let sb_dir = root.join("core").join("sing-box");
        std::fs::create_dir_all(&sb_dir).unwrap();
        let outside = root.join("mihomo");
        std::fs::write(&outside, b"bin").unwrap();
        let link = sb_dir.join("mihomo");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        assert!(validate_setup_binary(root, link.to_str().unwrap()).is_err());
    }

    #[tokio::test]
    async fn messages_are_newline_framed() {
        let (client, server) = tokio::io::duplex(4096);
        let (_r, mut w) = tokio::io::split(client);
        write_message(&mut w, &HelperRequest::ping()).await.unwrap();
        drop(w);

        let mut reader = tokio::io::BufReader::new(server);
        let got: Option<HelperRequest> = read_message(&mut reader).await.unwrap();
        assert_eq!(got, Some(HelperRequest::ping()));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let big = vec![b'a'; MAX_MESSAGE_BYTES + 10];
        let mut reader = tokio::io::BufReader::new(&big[..]);
        let res: anyhow::Result<Option<HelperRequest>> = read_message(&mut reader).await;
        assert!(res.is_err());
    }
}
