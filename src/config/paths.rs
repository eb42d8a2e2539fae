//! 运行目录布局
//!
//! artifacts 根目录存放内核、规则集、运行时 socket；用户数据目录存放 state.json。
//! 两者都作为显式值沿构造函数传递。

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::common::fsutil::is_dir_writable;
use crate::domain::EngineKind;

pub const ENV_ARTIFACTS_ROOT: &str = "VEA_ARTIFACTS_ROOT";
pub const ENV_USER_DATA_DIR: &str = "VEA_USER_DATA_DIR";

pub const HELPER_SOCKET_NAME: &str = "resolvectl-helper.sock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub artifacts_root: PathBuf,
    pub user_data_dir: PathBuf,
    pub state_file: PathBuf,
}

impl Paths {
    /// 按环境变量与平台约定解析目录；`state_override` 来自 `--state`
    pub fn resolve(state_override: Option<PathBuf>) -> Self {
        let artifacts_root = resolve_artifacts_root();
        let user_data_dir = resolve_user_data_dir();
        let state_file =
            state_override.unwrap_or_else(|| user_data_dir.join("data").join("state.json"));
        debug!(
            artifacts = %artifacts_root.display(),
            user_data = %user_data_dir.display(),
            state = %state_file.display(),
            "paths resolved"
        );
        Self {
            artifacts_root,
            user_data_dir,
            state_file,
        }
    }

    /// 以给定根目录构造（测试与嵌入场景）
    pub fn with_roots(artifacts_root: impl Into<PathBuf>, user_data_dir: impl Into<PathBuf>) -> Self {
        let user_data_dir = user_data_dir.into();
        Self {
            artifacts_root: artifacts_root.into(),
            state_file: user_data_dir.join("data").join("state.json"),
            user_data_dir,
        }
    }

    /// `<artifacts>/core/<engine dir>`
    pub fn core_dir(&self, engine: EngineKind) -> PathBuf {
        self.artifacts_root.join("core").join(engine.dir_name())
    }

    pub fn geo_dir(&self) -> PathBuf {
        self.artifacts_root.join("geo")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.artifacts_root.join("runtime")
    }

    pub fn helper_socket(&self) -> PathBuf {
        self.runtime_dir().join(HELPER_SOCKET_NAME)
    }

    pub fn shim_dir(&self) -> PathBuf {
        self.runtime_dir().join("bin")
    }

    pub fn rule_set_dir(&self) -> PathBuf {
        self.core_dir(EngineKind::SingBox).join("rule-set")
    }

    /// configDir 无法写入时使用的内核日志
    pub fn fallback_kernel_log(&self) -> PathBuf {
        self.runtime_dir().join("kernel.log")
    }
}

fn resolve_artifacts_root() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_ARTIFACTS_ROOT).map(PathBuf::from) {
        if !dir.as_os_str().is_empty() && is_dir_writable(&dir) {
            return dir;
        }
    }

    let mut candidates = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        candidates.push(exe_dir.join("artifacts"));
    }
    if let Some(cfg) = user_config_dir() {
        candidates.push(cfg.join("Vea").join("artifacts"));
    }
    if let Some(home) = home_dir() {
        candidates.push(home.join(".vea").join("artifacts"));
    }

    candidates
        .into_iter()
        .find(|dir| is_dir_writable(dir))
        .unwrap_or_else(|| PathBuf::from("artifacts"))
}

fn resolve_user_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_USER_DATA_DIR).map(PathBuf::from) {
        if !dir.as_os_str().is_empty() {
            return dir;
        }
    }
    if let Some(cfg) = user_config_dir() {
        return cfg.join("Vea");
    }
    if let Some(home) = home_dir() {
        return home.join(".vea");
    }
    std::env::temp_dir().join("Vea")
}

pub fn home_dir() -> Option<PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// 平台用户配置目录
pub fn user_config_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        return std::env::var_os("APPDATA")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
    }
    if cfg!(target_os = "macos") {
        return home_dir().map(|h| h.join("Library").join("Application Support"));
    }
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|h| h.join(".config")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_layout() {
        let p = Paths::with_roots("/a", "/u");
        assert_eq!(p.state_file, PathBuf::from("/u/data/state.json"));
        assert_eq!(p.core_dir(EngineKind::SingBox), PathBuf::from("/a/core/sing-box"));
        assert_eq!(p.core_dir(EngineKind::Xray), PathBuf::from("/a/core/xray"));
        assert_eq!(
            p.helper_socket(),
            PathBuf::from("/a/runtime/resolvectl-helper.sock")
        );
        assert_eq!(
            p.rule_set_dir(),
            PathBuf::from("/a/core/sing-box/rule-set")
        );
        assert_eq!(p.fallback_kernel_log(), PathBuf::from("/a/runtime/kernel.log"));
    }
}
