use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EngineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Xray,
    #[serde(alias = "sing-box")]
    Singbox,
    Clash,
    Geo,
    Generic,
}

impl ComponentKind {
    pub fn for_engine(engine: EngineKind) -> Option<Self> {
        match engine {
            EngineKind::Xray => Some(ComponentKind::Xray),
            EngineKind::SingBox => Some(ComponentKind::Singbox),
            EngineKind::Clash => Some(ComponentKind::Clash),
            EngineKind::Auto => None,
        }
    }

    pub fn engine(self) -> Option<EngineKind> {
        match self {
            ComponentKind::Xray => Some(EngineKind::Xray),
            ComponentKind::Singbox => Some(EngineKind::SingBox),
            ComponentKind::Clash => Some(EngineKind::Clash),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Xray => "xray",
            ComponentKind::Singbox => "singbox",
            ComponentKind::Clash => "clash",
            ComponentKind::Geo => "geo",
            ComponentKind::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    #[default]
    #[serde(rename = "")]
    Idle,
    Downloading,
    Extracting,
    Done,
    Error,
}

impl InstallStatus {
    fn is_idle(&self) -> bool {
        *self == InstallStatus::Idle
    }

    pub fn in_progress(self) -> bool {
        matches!(self, InstallStatus::Downloading | InstallStatus::Extracting)
    }
}

/// 已安装（或待安装）的内核组件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreComponent {
    pub id: String,
    pub name: String,
    pub kind: ComponentKind,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub archive_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_installed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub install_dir: String,
    #[serde(default)]
    pub last_version: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub last_sync_error: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "InstallStatus::is_idle")]
    pub install_status: InstallStatus,
    #[serde(default)]
    pub install_progress: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_message: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl CoreComponent {
    pub fn new(name: &str, kind: ComponentKind) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            name: name.to_string(),
            kind,
            source_url: String::new(),
            archive_type: String::new(),
            last_installed_at: None,
            install_dir: String::new(),
            last_version: String::new(),
            checksum: String::new(),
            last_sync_error: String::new(),
            meta: BTreeMap::new(),
            install_status: InstallStatus::Idle,
            install_progress: 0,
            install_message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 有安装目录且记录过安装时间
    pub fn is_installed(&self) -> bool {
        !self.install_dir.trim().is_empty() && self.last_installed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_requires_dir_and_timestamp() {
        let mut c = CoreComponent::new("xray", ComponentKind::Xray);
        assert!(!c.is_installed());
        c.install_dir = "/opt/xray".into();
        assert!(!c.is_installed());
        c.last_installed_at = Some(Utc::now());
        assert!(c.is_installed());
    }

    #[test]
    fn idle_status_is_empty_string() {
        let s: InstallStatus = serde_json::from_str("\"\"").unwrap();
        assert_eq!(s, InstallStatus::Idle);
        assert_eq!(
            serde_json::to_string(&InstallStatus::Downloading).unwrap(),
            "\"downloading\""
        );
    }
}
