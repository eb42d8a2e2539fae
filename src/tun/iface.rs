//! TUN 接口探测：出现与消失
//!
//! 两种就绪判定：
//! - 按名称（Linux 且指定了接口名）：接口存在，且启动前不存在或 ifindex 变了
//! - 按地址（其它情况）：启动前后对比，找带预期网段的新接口；
//!   超过阈值后也接受"看起来像 TUN"的旧接口

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Result, VeaError};
use crate::domain::TunSettings;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    /// 0 表示未知
    pub index: u32,
    pub addrs: Vec<IpAddr>,
    pub point_to_point: bool,
}

impl InterfaceInfo {
    pub fn looks_like_tun(&self) -> bool {
        self.point_to_point || self.name.starts_with("tun") || self.name.starts_with("utun")
    }

    fn carries_any(&self, cidrs: &[IpNet]) -> bool {
        self.addrs
            .iter()
            .any(|addr| cidrs.iter().any(|net| net.contains(addr)))
    }
}

/// 枚举本机网络接口
pub trait InterfaceProbe: Send + Sync {
    fn interfaces(&self) -> anyhow::Result<Vec<InterfaceInfo>>;

    fn lookup(&self, name: &str) -> Option<InterfaceInfo> {
        self.interfaces()
            .ok()?
            .into_iter()
            .find(|i| i.name == name)
    }
}

/// 启动前的接口快照：名称 → ifindex
#[derive(Debug, Clone, Default)]
pub struct InterfaceSnapshot {
    indexes: HashMap<String, u32>,
}

impl InterfaceSnapshot {
    pub fn capture(probe: &dyn InterfaceProbe) -> Self {
        let indexes = match probe.interfaces() {
            Ok(list) => list.into_iter().map(|i| (i.name, i.index)).collect(),
            Err(e) => {
                warn!(error = %e, "interface snapshot failed");
                HashMap::new()
            }
        };
        Self { indexes }
    }

    /// 快照里没有该接口时为 0
    pub fn index_of(&self, name: &str) -> u32 {
        self.indexes.get(name).copied().unwrap_or(0)
    }

    /// 不在快照里，或 ifindex 已变（被重建）
    fn is_new(&self, iface: &InterfaceInfo) -> bool {
        match self.indexes.get(&iface.name) {
            None => true,
            Some(&prev) => prev == 0 || (iface.index != 0 && iface.index != prev),
        }
    }
}

/// 就绪判定所需的预期
#[derive(Debug, Clone, Default)]
pub struct TunExpectation {
    /// Some 时按名称判定
    pub name: Option<String>,
    pub cidrs: Vec<IpNet>,
}

impl TunExpectation {
    /// Linux 上有明确接口名时按名称，否则按地址
    pub fn from_settings(settings: &TunSettings) -> Self {
        let name = settings.interface_name.trim();
        let cidrs = settings
            .address
            .iter()
            .filter_map(|a| a.trim().parse::<IpNet>().ok())
            .collect();
        Self {
            name: (cfg!(target_os = "linux") && !name.is_empty()).then(|| name.to_string()),
            cidrs,
        }
    }

    fn describe(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("interface with {:?}", self.cidrs),
        }
    }
}

/// 就绪轮询参数
#[derive(Debug, Clone, Copy)]
pub struct ReadyPolicy {
    pub timeout: Duration,
    pub poll: Duration,
    /// 按地址判定时，超过该时长才接受旧接口
    pub tun_like_after: Duration,
}

impl Default for ReadyPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll: Duration::from_millis(500),
            tun_like_after: Duration::from_secs(2),
        }
    }
}

/// 等待 TUN 接口出现，返回接口名；`done` 被取消说明内核已退出
pub async fn wait_ready(
    probe: &dyn InterfaceProbe,
    expect: &TunExpectation,
    snapshot: &InterfaceSnapshot,
    done: &CancellationToken,
    policy: ReadyPolicy,
) -> Result<String> {
    let started = Instant::now();
    loop {
        if done.is_cancelled() {
            return Err(VeaError::KernelExitedBeforeReady);
        }
        let elapsed = started.elapsed();
        let found = match &expect.name {
            Some(name) => ready_by_name(probe, name, snapshot),
            None => ready_by_address(probe, &expect.cidrs, snapshot, elapsed >= policy.tun_like_after),
        };
        if let Some(name) = found {
            debug!(interface = %name, elapsed = ?elapsed, "TUN interface ready");
            return Ok(name);
        }
        if elapsed >= policy.timeout {
            return Err(VeaError::TunNotReady(format!(
                "{} not ready after {:?}",
                expect.describe(),
                policy.timeout
            )));
        }
        tokio::select! {
            _ = tokio::time::sleep(policy.poll) => {}
            _ = done.cancelled() => {}
        }
    }
}

fn ready_by_name(probe: &dyn InterfaceProbe, name: &str, snapshot: &InterfaceSnapshot) -> Option<String> {
    let iface = probe.lookup(name)?;
    let prev = snapshot.index_of(name);
    (prev == 0 || iface.index != prev).then_some(iface.name)
}

fn ready_by_address(
    probe: &dyn InterfaceProbe,
    cidrs: &[IpNet],
    snapshot: &InterfaceSnapshot,
    accept_tun_like: bool,
) -> Option<String> {
    let list = probe.interfaces().ok()?;
    let matches = |i: &&InterfaceInfo| {
        if cidrs.is_empty() {
            i.looks_like_tun()
        } else {
            i.carries_any(cidrs)
        }
    };

    if let Some(i) = list.iter().filter(matches).find(|i| snapshot.is_new(i)) {
        return Some(i.name.clone());
    }
    if !accept_tun_like {
        return None;
    }
    list.iter()
        .filter(matches)
        .find(|i| i.looks_like_tun())
        .or_else(|| list.iter().find(|i| snapshot.is_new(i) && i.looks_like_tun()))
        .map(|i| i.name.clone())
}

/// 等待接口消失；超时返回 false
pub async fn wait_absent(probe: &dyn InterfaceProbe, name: &str, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe.lookup(name).is_none() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

// ─── 系统实现 ───

/// 读取真实网卡
pub struct SystemProbe;

#[cfg(unix)]
impl InterfaceProbe for SystemProbe {
    fn interfaces(&self) -> anyhow::Result<Vec<InterfaceInfo>> {
        use std::ffi::CStr;

        let mut by_name: Vec<InterfaceInfo> = Vec::new();
        // SAFETY: getifaddrs 填充链表，遍历结束后用 freeifaddrs 释放
        unsafe {
            let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
            if libc::getifaddrs(&mut addrs) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            let mut cursor = addrs;
            while !cursor.is_null() {
                let ifa = &*cursor;
                cursor = ifa.ifa_next;
                if ifa.ifa_name.is_null() {
                    continue;
                }
                let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
                let pos = match by_name.iter().position(|i| i.name == name) {
                    Some(pos) => pos,
                    None => {
                        let index = libc::if_nametoindex(ifa.ifa_name);
                        by_name.push(InterfaceInfo {
                            name,
                            index,
                            addrs: Vec::new(),
                            point_to_point: false,
                        });
                        by_name.len() - 1
                    }
                };
                let entry = &mut by_name[pos];
                if (ifa.ifa_flags as i32) & libc::IFF_POINTOPOINT != 0 {
                    entry.point_to_point = true;
                }
                if let Some(ip) = sockaddr_ip(ifa.ifa_addr) {
                    entry.addrs.push(ip);
                }
            }
            libc::freeifaddrs(addrs);
        }
        Ok(by_name)
    }
}

#[cfg(unix)]
unsafe fn sockaddr_ip(sa: *const libc::sockaddr) -> Option<IpAddr> {
    if sa.is_null() {
        return None;
    }
    match (*sa).sa_family as i32 {
        libc::AF_INET => {
            let sin = &*(sa as *const libc::sockaddr_in);
            Some(IpAddr::from(u32::from_be(sin.sin_addr.s_addr).to_be_bytes()))
        }
        libc::AF_INET6 => {
            let sin6 = &*(sa as *const libc::sockaddr_in6);
            Some(IpAddr::from(sin6.sin6_addr.s6_addr))
        }
        _ => None,
    }
}

#[cfg(windows)]
impl InterfaceProbe for SystemProbe {
    fn interfaces(&self) -> anyhow::Result<Vec<InterfaceInfo>> {
        let out = crate::common::platform::hidden_command("netsh")
            .args(["interface", "ipv4", "show", "addresses"])
            .output()?;
        Ok(parse_netsh_addresses(&String::from_utf8_lossy(&out.stdout)))
    }
}

#[cfg(not(any(unix, windows)))]
impl InterfaceProbe for SystemProbe {
    fn interfaces(&self) -> anyhow::Result<Vec<InterfaceInfo>> {
        Ok(Vec::new())
    }
}

/// 解析 `netsh interface ipv4 show addresses`：引号内为接口名，随后的 IPv4 属于该接口
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_netsh_addresses(text: &str) -> Vec<InterfaceInfo> {
    let mut out: Vec<InterfaceInfo> = Vec::new();
    for line in text.lines() {
        if let Some(start) = line.find('"') {
            if let Some(len) = line[start + 1..].find('"') {
                out.push(InterfaceInfo {
                    name: line[start + 1..start + 1 + len].to_string(),
                    ..Default::default()
                });
                continue;
            }
        }
        let Some(current) = out.last_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.to_ascii_lowercase().contains("ip") {
            continue;
        }
        if let Ok(ip) = value.trim().parse::<IpAddr>() {
            current.addrs.push(ip);
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use super::*;

    /// 由测试随时改写的接口表
    #[derive(Default)]
    pub struct ScriptedProbe {
        pub list: Mutex<Vec<InterfaceInfo>>,
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedProbe {
        pub fn set(&self, list: Vec<InterfaceInfo>) {
            *self.list.lock().unwrap() = list;
        }

        pub fn iface(name: &str, index: u32, addr: Option<&str>) -> InterfaceInfo {
            InterfaceInfo {
                name: name.to_string(),
                index,
                addrs: addr.map(|a| a.parse().unwrap()).into_iter().collect(),
                point_to_point: false,
            }
        }
    }

    impl InterfaceProbe for ScriptedProbe {
        fn interfaces(&self) -> anyhow::Result<Vec<InterfaceInfo>> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.list.lock().unwrap().clone())
        }
    }
}
