//! 系统代理驱动
//!
//! 每个平台把一次 `apply` 展开成一组命令（纯函数，便于测试），再顺序执行：
//! - Linux：GNOME `gsettings`，缺失时只返回提示
//! - macOS：对每个启用的网络服务执行 `networksetup`
//! - Windows：写 Internet Settings 注册表后通知 WinINet 刷新

pub mod linux;
pub mod macos;
pub mod windows;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::{Result, VeaError};

/// 默认绕过列表
pub const DEFAULT_IGNORE_HOSTS: &[&str] = &["127.0.0.0/8", "::1", "localhost"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// 一次系统代理变更
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemProxyRequest {
    pub enabled: bool,
    pub http: Option<ProxyEndpoint>,
    pub https: Option<ProxyEndpoint>,
    pub socks: Option<ProxyEndpoint>,
    pub ignore_hosts: Vec<String>,
}

impl SystemProxyRequest {
    pub fn disabled() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait SystemProxyDriver: Send + Sync {
    /// 成功时可能带一条"尽力而为"的提示
    async fn apply(&self, req: &SystemProxyRequest) -> Result<Option<String>>;
}

/// 当前平台的真实实现
pub struct OsProxyDriver;

#[async_trait]
impl SystemProxyDriver for OsProxyDriver {
    async fn apply(&self, req: &SystemProxyRequest) -> Result<Option<String>> {
        let req = req.clone();
        tokio::task::spawn_blocking(move || apply_blocking(&req))
            .await
            .map_err(|e| VeaError::Other(anyhow!("system proxy task: {}", e)))?
    }
}

#[cfg(target_os = "linux")]
fn apply_blocking(req: &SystemProxyRequest) -> Result<Option<String>> {
    if crate::common::fsutil::look_path("gsettings").is_none() {
        return Ok(Some(linux::MISSING_GSETTINGS.to_string()));
    }
    run_all(&linux::plan(req))?;
    Ok(None)
}

#[cfg(target_os = "macos")]
fn apply_blocking(req: &SystemProxyRequest) -> Result<Option<String>> {
    let out = std::process::Command::new("networksetup")
        .arg("-listallnetworkservices")
        .output()
        .context("networksetup -listallnetworkservices")?;
    if !out.status.success() {
        return Err(anyhow!(
            "networksetup -listallnetworkservices failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )
        .into());
    }
    let services = macos::parse_services(&String::from_utf8_lossy(&out.stdout));
    if services.is_empty() {
        return Err(anyhow!("no network services found").into());
    }
    run_all(&macos::plan(req, &services))?;
    Ok(None)
}

#[cfg(windows)]
fn apply_blocking(req: &SystemProxyRequest) -> Result<Option<String>> {
    let plan = windows::plan(req)?;
    run_all(&plan)?;
    windows::notify_settings_changed();
    Ok(None)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn apply_blocking(req: &SystemProxyRequest) -> Result<Option<String>> {
    if req.enabled {
        return Err(anyhow!("system proxy configuration not supported on this platform").into());
    }
    Ok(None)
}

/// 逐条执行，遇到第一条失败即返回
#[cfg_attr(
    not(any(target_os = "linux", target_os = "macos", windows)),
    allow(dead_code)
)]
fn run_all(plan: &[Vec<String>]) -> anyhow::Result<()> {
    for argv in plan {
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        let out = crate::common::platform::hidden_command(program)
            .args(args)
            .output()
            .with_context(|| format!("run {}", program))?;
        if !out.status.success() {
            let msg = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(anyhow!(
                "{} failed: {} ({})",
                argv.join(" "),
                out.status,
                if msg.is_empty() { "unknown error" } else { &msg }
            ));
        }
        debug!(command = %argv.join(" "), "system proxy command ok");
    }
    info!(commands = plan.len(), "system proxy applied");
    Ok(())
}

pub(crate) fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use super::*;

    /// 记录每次 apply，不碰系统设置
    #[derive(Default)]
    pub struct RecordingDriver {
        pub applied: Mutex<Vec<SystemProxyRequest>>,
        pub advisory: Option<String>,
    }

    impl RecordingDriver {
        pub fn last(&self) -> Option<SystemProxyRequest> {
            self.applied.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl SystemProxyDriver for RecordingDriver {
        async fn apply(&self, req: &SystemProxyRequest) -> Result<Option<String>> {
            self.applied.lock().unwrap().push(req.clone());
            Ok(self.advisory.clone())
        }
    }
}
