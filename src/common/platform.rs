//! 平台小工具：权限判断与子进程构造

use std::process::Command;

/// 当前平台名，前端按此展示（macOS 记为 darwin）
pub fn platform_name() -> &'static str {
    if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(windows) {
        "windows"
    } else {
        std::env::consts::OS
    }
}

#[cfg(unix)]
pub fn current_uid() -> u32 {
    // SAFETY: geteuid 没有前置条件
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
pub fn current_uid() -> u32 {
    0
}

/// root（Unix）或管理员（Windows）
#[cfg(unix)]
pub fn is_root() -> bool {
    current_uid() == 0
}

#[cfg(windows)]
pub fn is_root() -> bool {
    // `net session` 只有管理员能成功执行
    hidden_command("net")
        .arg("session")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_root() -> bool {
    false
}

/// 构造不弹出控制台窗口的命令
pub fn hidden_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// 进程是否仍存在（signal 0 探测）
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(pid, 0) 只做存在性检查
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}
