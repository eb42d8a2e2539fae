//! TUN 权限状态检查

use std::path::Path;
use std::process::Command;

use serde::Serialize;
use tracing::debug;

use super::setup::{lookup_user, split_caps, REQUIRED_CAPS, TUN_USER};
use crate::common::platform;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunCapabilityStatus {
    pub platform: String,
    pub user_exists: bool,
    pub binary_found: bool,
    pub binary_path: String,
    pub current_caps: Vec<String>,
    pub missing_caps: Vec<String>,
    pub fully_configured: bool,
    pub is_root: bool,
}

impl TunCapabilityStatus {
    /// root 本身就能建 TUN，不要求 capabilities
    pub fn usable(&self) -> bool {
        self.is_root || self.fully_configured
    }
}

/// 读取权限状态；测试中替换为脚本化实现
pub trait CapabilityProbe: Send + Sync {
    fn status(&self, binary: Option<&Path>) -> TunCapabilityStatus;
}

pub struct SystemCapabilityProbe;

impl CapabilityProbe for SystemCapabilityProbe {
    fn status(&self, binary: Option<&Path>) -> TunCapabilityStatus {
        let is_root = platform::is_root();
        let mut status = TunCapabilityStatus {
            platform: platform::platform_name().to_string(),
            is_root,
            ..Default::default()
        };

        if !cfg!(target_os = "linux") {
            // macOS / Windows 没有文件能力模型，只看进程权限
            status.binary_found = binary.map(Path::is_file).unwrap_or(false);
            status.binary_path = binary.map(|b| b.display().to_string()).unwrap_or_default();
            status.fully_configured = is_root;
            return status;
        }

        status.user_exists = lookup_user(TUN_USER).is_some();
        let Some(binary) = binary.filter(|b| b.is_file()) else {
            status.missing_caps = REQUIRED_CAPS.iter().map(|c| c.to_string()).collect();
            return status;
        };
        status.binary_found = true;
        status.binary_path = binary.display().to_string();

        let output = Command::new("getcap")
            .arg(binary)
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
            .unwrap_or_default();
        debug!(binary = %binary.display(), getcap = %output.trim(), "TUN capability check");
        let (current, missing) = split_caps(&output);
        status.current_caps = current;
        status.missing_caps = missing;
        status.fully_configured = status.user_exists && status.missing_caps.is_empty();
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_reports_all_caps_missing() {
        let status = SystemCapabilityProbe.status(Some(Path::new("/nonexistent/sing-box")));
        assert!(!status.binary_found);
        if cfg!(target_os = "linux") {
            assert_eq!(status.missing_caps.len(), 3);
            assert!(!status.fully_configured);
        }
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("fullyConfigured").is_some());
        assert!(json.get("missingCaps").is_some());
    }

    #[test]
    fn root_is_always_usable() {
        let status = TunCapabilityStatus {
            is_root: true,
            ..Default::default()
        };
        assert!(status.usable());
        assert!(!TunCapabilityStatus::default().usable());
    }
}
