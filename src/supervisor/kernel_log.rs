//! 内核日志：每次启动一个会话文件，前端按字节偏移增量读取

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::adapter::ProcessHandle;
use crate::domain::EngineKind;

pub const KERNEL_LOG_NAME: &str = "kernel.log";

/// 当前（或最近一次）日志会话
///
/// 与 Supervisor 主锁分开保存，读日志不会被进行中的 Start 卡住。
#[derive(Debug, Clone, Default)]
pub struct KernelLogState {
    pub path: Option<PathBuf>,
    pub session: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub engine: Option<EngineKind>,
    pub handle: Option<Arc<ProcessHandle>>,
    /// sing-box `log.output`
    pub singbox_output: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelLogSnapshot {
    pub session: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub from: u64,
    pub to: u64,
    pub end: u64,
    pub lost: bool,
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// 组装 `since` 之后的日志快照
pub fn snapshot(state: &KernelLogState, since: u64, max: u64) -> KernelLogSnapshot {
    let running = state.handle.as_ref().is_some_and(|h| h.is_running());
    let mut snap = KernelLogSnapshot {
        session: state.session,
        engine: state.engine,
        running,
        pid: state.handle.as_ref().filter(|_| running).and_then(|h| h.pid),
        started_at: state
            .started_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        ..Default::default()
    };
    let Some(log_path) = &state.path else {
        return snap;
    };
    let read_path = effective_read_path(log_path, state.engine, state.singbox_output.as_deref());
    snap.path = read_path.display().to_string();

    match read_chunk(&read_path, since, max) {
        Ok(chunk) => {
            if running && chunk.end == 0 && !read_path.exists() {
                snap.error = format!("log file not found: {}", snap.path);
            }
            snap.from = chunk.from;
            snap.to = chunk.to;
            snap.end = chunk.end;
            snap.lost = chunk.lost;
            snap.text = chunk.text;
        }
        Err(e) => snap.error = e.to_string(),
    }
    snap
}

/// 截断打开 `primary`，失败时改用 `fallback`；两者都失败返回 None（内核照常启动，只是没有日志）
pub fn open_session(primary: &Path, fallback: &Path, engine: EngineKind) -> Option<(PathBuf, File)> {
    let (path, mut file) = match open_truncated(primary) {
        Ok(f) => (primary.to_path_buf(), f),
        Err(e) => {
            warn!(path = %primary.display(), error = %e, "open kernel log failed");
            match open_truncated(fallback) {
                Ok(f) => {
                    info!(path = %fallback.display(), "using fallback kernel log");
                    (fallback.to_path_buf(), f)
                }
                Err(e) => {
                    warn!(path = %fallback.display(), error = %e, "open fallback kernel log failed");
                    return None;
                }
            }
        }
    };
    let _ = writeln!(file, "{}", session_marker(Utc::now(), engine));
    Some((path, file))
}

pub fn session_marker(at: DateTime<Utc>, engine: EngineKind) -> String {
    format!(
        "----- kernel start {} engine={} -----",
        at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        engine
    )
}

fn open_truncated(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let file = opts.open(path)?;
    // mode 只对新建文件生效，上次运行留下的文件要显式收紧
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

/// 一段读取结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub from: u64,
    pub to: u64,
    pub end: u64,
    /// 偏移越过文件尾（文件被截断过），已从头重读
    pub lost: bool,
    pub text: String,
}

/// 从 `since` 起读取至多 `max` 字节；文件不存在视为空
pub fn read_chunk(path: &Path, since: u64, max: u64) -> std::io::Result<Chunk> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Chunk::default()),
        Err(e) => return Err(e),
    };
    let end = file.metadata()?.len();
    let (from, lost) = if since > end { (0, true) } else { (since, false) };

    file.seek(SeekFrom::Start(from))?;
    let mut data = Vec::new();
    file.take((end - from).min(max)).read_to_end(&mut data)?;
    Ok(Chunk {
        from,
        to: from + data.len() as u64,
        end,
        lost,
        text: String::from_utf8_lossy(&data).into_owned(),
    })
}

/// sing-box 可把日志直接写进 `log.output`，此时 stdout 基本为空，优先读它
pub fn effective_read_path(
    log_path: &Path,
    engine: Option<EngineKind>,
    singbox_output: Option<&str>,
) -> PathBuf {
    let output = singbox_output.map(str::trim).unwrap_or_default();
    if engine != Some(EngineKind::SingBox)
        || output.is_empty()
        || output == "stdout"
        || output == "stderr"
    {
        return log_path.to_path_buf();
    }
    let p = Path::new(output);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match log_path.parent() {
        Some(dir) => dir.join(p),
        None => p.to_path_buf(),
    }
}
