//! Linux TUN 能力配置（需要 root）
//!
//! 创建系统用户 `vea-tun`，把内核二进制 chown 给它，再 setcap。
//! chown 会清掉文件 capabilities，所以顺序不能反。

use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info};

use crate::common::platform;

pub const TUN_USER: &str = "vea-tun";
pub const TUN_GROUP: &str = "vea-tun";

/// cap_net_admin 建 TUN/改路由，cap_net_bind_service 绑低端口，cap_net_raw 绑定物理网卡
pub const REQUIRED_CAPS: [&str; 3] = ["cap_net_admin", "cap_net_bind_service", "cap_net_raw"];

/// groupadd/useradd 的"已存在"退出码
const EXIT_ALREADY_EXISTS: i32 = 9;

pub fn caps_spec() -> String {
    REQUIRED_CAPS.join(",")
}

/// 自动配置失败时给用户的手动命令
pub fn manual_hint(binary: &Path) -> String {
    format!("请手动运行: sudo setcap '{}+ep' {}", caps_spec(), binary.display())
}

/// `vea setup-tun` 与 helper 的 `tun-setup` 共用
pub fn setup_tun_binary(binary: &Path) -> anyhow::Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("TUN capability setup is only needed on Linux");
    }
    if !platform::is_root() {
        bail!("TUN setup requires root privileges");
    }
    if binary.as_os_str().is_empty() {
        bail!("binary path is empty");
    }
    ensure_tun_user().context("failed to create TUN user")?;
    apply_caps(binary).context("failed to set capabilities")?;
    info!(binary = %binary.display(), "TUN capabilities configured");
    Ok(())
}

fn ensure_tun_user() -> anyhow::Result<()> {
    if lookup_user(TUN_USER).is_some() {
        return Ok(());
    }
    run_allow_exists(Command::new("groupadd").args(["-r", TUN_GROUP]), "groupadd")?;
    run_allow_exists(
        Command::new("useradd").args([
            "-r",
            "-s",
            "/usr/sbin/nologin",
            "-g",
            TUN_GROUP,
            "-M",
            "-c",
            "Vea TUN Mode User",
            TUN_USER,
        ]),
        "useradd",
    )
}

fn run_allow_exists(cmd: &mut Command, what: &str) -> anyhow::Result<()> {
    let status = cmd.status().with_context(|| format!("run {}", what))?;
    match status.code() {
        Some(0) => Ok(()),
        Some(EXIT_ALREADY_EXISTS) => {
            debug!(command = what, "entry already exists");
            Ok(())
        }
        _ => Err(anyhow!("{} failed: {}", what, status)),
    }
}

#[cfg(unix)]
fn apply_caps(binary: &Path) -> anyhow::Result<()> {
    let (uid, gid) =
        lookup_user(TUN_USER).ok_or_else(|| anyhow!("user {} not found", TUN_USER))?;
    std::os::unix::fs::chown(binary, Some(uid), Some(gid)).context("chown failed")?;

    let status = Command::new("setcap")
        .arg(format!("{}+ep", caps_spec()))
        .arg(binary)
        .status()
        .context("run setcap")?;
    if !status.success() {
        bail!("setcap failed: {}", status);
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_caps(_binary: &Path) -> anyhow::Result<()> {
    bail!("setcap is not available on this platform")
}

/// 从 /etc/passwd 查 uid/gid
pub fn lookup_user(name: &str) -> Option<(u32, u32)> {
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    parse_passwd(&passwd, name)
}

fn parse_passwd(content: &str, name: &str) -> Option<(u32, u32)> {
    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        if fields.next()? != name {
            return None;
        }
        let _password = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        Some((uid, gid))
    })
}

/// 解析 getcap 输出，返回 (已有, 缺少)
pub fn split_caps(getcap_output: &str) -> (Vec<String>, Vec<String>) {
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for cap in REQUIRED_CAPS {
        if getcap_output.contains(cap) {
            present.push(cap.to_string());
        } else {
            missing.push(cap.to_string());
        }
    }
    (present, missing)
}
