//! Linux 特权 helper
//!
//! 一个由 pkexec 拉起的长驻 root 进程，经 Unix socket 只执行白名单操作：
//! 转发 resolvectl、为内核二进制设置 TUN 能力、清理残留路由。

pub mod client;
pub mod protocol;
#[cfg(unix)]
pub mod server;
pub mod shim;

use std::path::PathBuf;

use crate::common::fsutil::look_path;

pub use client::{default_helper, HelperClient, HelperLauncher, NoHelper, PkexecLauncher, PrivilegedHelper};
pub use protocol::{HelperOp, HelperRequest, HelperResponse};

/// 系统 resolvectl 的位置
pub fn real_resolvectl() -> PathBuf {
    let fixed = PathBuf::from("/usr/bin/resolvectl");
    if fixed.exists() {
        return fixed;
    }
    look_path("resolvectl").unwrap_or(fixed)
}
