use thiserror::Error;

use crate::domain::EngineKind;

#[derive(Error, Debug)]
pub enum VeaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("engine not installed: {engine}")]
    EngineNotInstalled { engine: EngineKind },

    #[error("no compatible engine: {reason}")]
    NoCompatibleEngine { reason: String },

    #[error("compile frouter: {}", problems.join("; "))]
    CompileError { problems: Vec<String> },

    #[error("failed to start process: {0}")]
    SpawnError(String),

    #[error("process not ready: {0}")]
    ProcessNotReady(String),

    #[error("kernel exited before ready")]
    KernelExitedBeforeReady,

    #[error("TUN interface not ready: {0}")]
    TunNotReady(String),

    #[error("previous TUN is still busy: {0}")]
    TunBusy(String),

    #[error("{0}")]
    TunNotConfigured(String),

    #[error("{cause}; rollback: {rollback}")]
    RollbackFailed {
        cause: Box<VeaError>,
        rollback: String,
    },

    #[error("privileged helper unavailable: {reason}\n{hint}")]
    PrivilegedHelperUnavailable { reason: String, hint: String },

    #[error("{0}")]
    InboundModeConflict(String),

    #[error("state file corrupt: {0}")]
    PersistLoadCorrupt(String),

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("install timeout: {0}")]
    InstallTimeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = VeaError> = std::result::Result<T, E>;

impl VeaError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        VeaError::InvalidInput(msg.into())
    }

    /// 启动失败后是否应由调用方安装组件并重试
    pub fn is_engine_not_installed(&self) -> bool {
        matches!(self, VeaError::EngineNotInstalled { .. })
    }

    /// 从 anyhow::Error 中提取分类，无法识别时按 io::Error 粗分
    pub fn classify(err: &anyhow::Error) -> VeaErrorKind {
        if let Some(ve) = err.downcast_ref::<VeaError>() {
            return ve.kind();
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::NotFound => VeaErrorKind::NotFound,
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                    VeaErrorKind::InvalidInput
                }
                _ => VeaErrorKind::Io,
            };
        }
        VeaErrorKind::Other
    }

    pub fn kind(&self) -> VeaErrorKind {
        match self {
            VeaError::Io(_) => VeaErrorKind::Io,
            VeaError::InvalidInput(_) => VeaErrorKind::InvalidInput,
            VeaError::NotFound(_) => VeaErrorKind::NotFound,
            VeaError::EngineNotInstalled { .. } => VeaErrorKind::EngineNotInstalled,
            VeaError::NoCompatibleEngine { .. } => VeaErrorKind::NoCompatibleEngine,
            VeaError::CompileError { .. } => VeaErrorKind::CompileError,
            VeaError::SpawnError(_) => VeaErrorKind::SpawnError,
            VeaError::ProcessNotReady(_) => VeaErrorKind::ProcessNotReady,
            VeaError::KernelExitedBeforeReady => VeaErrorKind::KernelExitedBeforeReady,
            VeaError::TunNotReady(_) => VeaErrorKind::TunNotReady,
            VeaError::TunBusy(_) => VeaErrorKind::TunBusy,
            VeaError::TunNotConfigured(_) => VeaErrorKind::TunNotConfigured,
            VeaError::RollbackFailed { .. } => VeaErrorKind::RollbackFailed,
            VeaError::PrivilegedHelperUnavailable { .. } => {
                VeaErrorKind::PrivilegedHelperUnavailable
            }
            VeaError::InboundModeConflict(_) => VeaErrorKind::InboundModeConflict,
            VeaError::PersistLoadCorrupt(_) => VeaErrorKind::PersistLoadCorrupt,
            VeaError::InstallFailed(_) => VeaErrorKind::InstallFailed,
            VeaError::InstallTimeout(_) => VeaErrorKind::InstallTimeout,
            VeaError::Cancelled => VeaErrorKind::Cancelled,
            VeaError::Other(e) => VeaError::classify(e),
        }
    }
}

/// 错误类别，便于模式匹配而无需借用错误本身
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VeaErrorKind {
    Io,
    InvalidInput,
    NotFound,
    EngineNotInstalled,
    NoCompatibleEngine,
    CompileError,
    SpawnError,
    ProcessNotReady,
    KernelExitedBeforeReady,
    TunNotReady,
    TunBusy,
    TunNotConfigured,
    RollbackFailed,
    PrivilegedHelperUnavailable,
    InboundModeConflict,
    PersistLoadCorrupt,
    InstallFailed,
    InstallTimeout,
    Cancelled,
    Other,
}

impl VeaErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VeaErrorKind::Io => "IO",
            VeaErrorKind::InvalidInput => "INVALID_INPUT",
            VeaErrorKind::NotFound => "NOT_FOUND",
            VeaErrorKind::EngineNotInstalled => "ENGINE_NOT_INSTALLED",
            VeaErrorKind::NoCompatibleEngine => "NO_COMPATIBLE_ENGINE",
            VeaErrorKind::CompileError => "COMPILE_ERROR",
            VeaErrorKind::SpawnError => "SPAWN_ERROR",
            VeaErrorKind::ProcessNotReady => "PROCESS_NOT_READY",
            VeaErrorKind::KernelExitedBeforeReady => "KERNEL_EXITED",
            VeaErrorKind::TunNotReady => "TUN_NOT_READY",
            VeaErrorKind::TunBusy => "TUN_BUSY",
            VeaErrorKind::TunNotConfigured => "TUN_NOT_CONFIGURED",
            VeaErrorKind::RollbackFailed => "ROLLBACK_FAILED",
            VeaErrorKind::PrivilegedHelperUnavailable => "HELPER_UNAVAILABLE",
            VeaErrorKind::InboundModeConflict => "INBOUND_MODE_CONFLICT",
            VeaErrorKind::PersistLoadCorrupt => "PERSIST_CORRUPT",
            VeaErrorKind::InstallFailed => "INSTALL_FAILED",
            VeaErrorKind::InstallTimeout => "INSTALL_TIMEOUT",
            VeaErrorKind::Cancelled => "CANCELLED",
            VeaErrorKind::Other => "OTHER",
        }
    }

    /// HTTP 层使用的状态码
    pub fn http_status(self) -> u16 {
        match self {
            VeaErrorKind::InvalidInput
            | VeaErrorKind::NoCompatibleEngine
            | VeaErrorKind::InboundModeConflict
            | VeaErrorKind::CompileError => 400,
            VeaErrorKind::NotFound => 404,
            VeaErrorKind::TunBusy => 409,
            VeaErrorKind::EngineNotInstalled
            | VeaErrorKind::InstallFailed
            | VeaErrorKind::InstallTimeout => 424,
            _ => 500,
        }
    }

    /// 用户输入问题，重试无意义
    pub fn is_user_error(self) -> bool {
        matches!(
            self,
            VeaErrorKind::InvalidInput
                | VeaErrorKind::NoCompatibleEngine
                | VeaErrorKind::InboundModeConflict
                | VeaErrorKind::CompileError
        )
    }
}

impl From<VeaError> for std::io::Error {
    fn from(e: VeaError) -> Self {
        std::io::Error::other(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_wrapped_vea_error() {
        let err = anyhow::Error::new(VeaError::TunBusy("tun0".into()));
        assert_eq!(VeaError::classify(&err), VeaErrorKind::TunBusy);
    }

    #[test]
    fn classify_io_not_found() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert_eq!(VeaError::classify(&err), VeaErrorKind::NotFound);
    }

    #[test]
    fn compile_error_lists_problems() {
        let err = VeaError::CompileError {
            problems: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "compile frouter: a; b");
        assert_eq!(err.kind().http_status(), 400);
    }

    #[test]
    fn rollback_error_shows_both_sides() {
        let err = VeaError::RollbackFailed {
            cause: Box::new(VeaError::ProcessNotReady("port 1080".into())),
            rollback: "restart previous: spawn failed".into(),
        };
        let text = err.to_string();
        assert!(text.contains("port 1080"));
        assert!(text.contains("spawn failed"));
        assert_eq!(err.kind().as_str(), "ROLLBACK_FAILED");
    }

    #[test]
    fn other_reclassifies_inner() {
        let inner = anyhow::Error::new(VeaError::invalid("bad"));
        let err = VeaError::Other(inner);
        assert_eq!(err.kind(), VeaErrorKind::InvalidInput);
    }
}
