//! 残留路由与残留进程清理（尽力而为）

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use crate::common::fsutil::look_path;

/// 一条清理命令；失败输出含这些片段时视为"本来就没有"
struct CleanupStep {
    argv: &'static [&'static str],
    /// 重复执行直到失败（同一条 ip rule 可能残留多份）
    repeat: usize,
}

const EXPECTED_MISSING: &[&str] = &[
    "No such file",
    "does not exist",
    "No chain/target/match",
    "Bad rule",
    "Cannot find device",
];

const STEPS: &[CleanupStep] = &[
    // sing-box auto_redirect 建的 nftables 表
    CleanupStep { argv: &["nft", "delete", "table", "inet", "sing-box"], repeat: 1 },
    CleanupStep { argv: &["nft", "delete", "table", "ip", "sing-box"], repeat: 1 },
    CleanupStep { argv: &["nft", "delete", "table", "ip6", "sing-box"], repeat: 1 },
    // sing-box auto_route 的策略路由
    CleanupStep { argv: &["ip", "rule", "del", "from", "all", "lookup", "2022"], repeat: 10 },
    CleanupStep { argv: &["ip", "route", "flush", "table", "2022"], repeat: 1 },
    // xray 透明代理残留的 mangle 链
    CleanupStep { argv: &["iptables", "-t", "mangle", "-D", "PREROUTING", "-j", "XRAY"], repeat: 1 },
    CleanupStep { argv: &["iptables", "-t", "mangle", "-D", "OUTPUT", "-j", "XRAY_SELF"], repeat: 1 },
    CleanupStep { argv: &["iptables", "-t", "mangle", "-F", "XRAY"], repeat: 1 },
    CleanupStep { argv: &["iptables", "-t", "mangle", "-X", "XRAY"], repeat: 1 },
    CleanupStep { argv: &["iptables", "-t", "mangle", "-F", "XRAY_SELF"], repeat: 1 },
    CleanupStep { argv: &["iptables", "-t", "mangle", "-X", "XRAY_SELF"], repeat: 1 },
    CleanupStep { argv: &["ip", "rule", "del", "fwmark", "0x1", "table", "100"], repeat: 1 },
];

/// 需要执行的命令，便于展示与测试
pub fn cleanup_argv() -> Vec<Vec<&'static str>> {
    STEPS.iter().map(|s| s.argv.to_vec()).collect()
}

/// 以当前身份执行全部清理命令（需要 root 才有效果）
pub fn run_local_cleanup() {
    if !cfg!(target_os = "linux") {
        return;
    }
    for step in STEPS {
        for _ in 0..step.repeat.max(1) {
            if !run_step(step.argv) {
                break;
            }
        }
    }
}

/// 成功返回 true
fn run_step(argv: &[&str]) -> bool {
    let Some((program, args)) = argv.split_first() else {
        return false;
    };
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => {
            info!(command = %argv.join(" "), "removed leftover TUN state");
            true
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !EXPECTED_MISSING.iter().any(|m| stderr.contains(m)) {
                debug!(command = %argv.join(" "), stderr = %stderr.trim(), "cleanup step failed");
            }
            false
        }
        Err(e) => {
            debug!(command = %argv.join(" "), error = %e, "cleanup command unavailable");
            false
        }
    }
}

/// 杀掉命令行引用了该配置文件的进程
///
/// 上一个内核可能以 root 运行，普通 pkill 无权限时在 Linux 上经 pkexec 重试；
/// 先用 pgrep 确认确实有目标，避免白弹一次授权框。
pub fn kill_processes_using_config(config_path: &Path) {
    let path = config_path.to_string_lossy();
    let path = path.trim();
    if path.is_empty() {
        return;
    }
    let pattern = config_pattern(path);

    let Some(pkill) = look_path("pkill") else {
        return;
    };
    let killed = Command::new(&pkill)
        .args(["-f", &pattern])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if killed || !cfg!(target_os = "linux") {
        return;
    }

    let Some(pkexec) = look_path("pkexec") else {
        return;
    };
    if let Some(pgrep) = look_path("pgrep") {
        let any = Command::new(pgrep)
            .args(["-f", &pattern])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !any {
            return;
        }
    }
    info!(config = %path, "killing leftover kernel via pkexec");
    let _ = Command::new(pkexec).arg(pkill).args(["-f", &pattern]).status();
}

/// `pkill -f` 按扩展正则匹配整条命令行，路径里的 `.` `+` 等需要转义
fn config_pattern(path: &str) -> String {
    regex::escape(path)
}
