//! 内核组件安装：GitHub Release 下载 + 解压
//!
//! 安装过程把进度写回组件记录（downloading → extracting → done / error），
//! 前端与 Facade 都通过轮询组件状态观察结果。

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tracing::{info, warn};

use super::{rule_set, sha256_hex, Downloader};
use crate::adapter::AdapterSet;
use crate::common::fsutil;
use crate::config::Paths;
use crate::domain::{CoreComponent, EngineKind, InstallStatus};
use crate::repository::ComponentRepository;

#[async_trait]
pub trait ComponentInstaller: Send + Sync {
    /// 完整执行一次安装；同一组件已在安装中时直接返回
    async fn install(&self, component_id: &str) -> Result<()>;
}

/// 发布包压缩格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    /// 单文件 gzip（mihomo 在 Linux/macOS 的发布形式）
    Gz,
    Raw,
}

impl ArchiveKind {
    pub fn infer(asset_name: &str) -> Self {
        let lower = asset_name.trim().to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if lower.ends_with(".zip") {
            ArchiveKind::Zip
        } else if lower.ends_with(".gz") {
            ArchiveKind::Gz
        } else {
            ArchiveKind::Raw
        }
    }
}

/// 发布仓库与资源名模板（`*` 替换为不带 v 的版本号）
pub fn release_source(engine: EngineKind, os: &str, arch: &str) -> Result<(&'static str, &'static str)> {
    let template = match (engine, os, arch) {
        (EngineKind::Xray, "linux", "x86_64") => "Xray-linux-64.zip",
        (EngineKind::Xray, "linux", "x86") => "Xray-linux-32.zip",
        (EngineKind::Xray, "linux", "aarch64") => "Xray-linux-arm64-v8a.zip",
        (EngineKind::Xray, "linux", "arm") => "Xray-linux-arm32-v7a.zip",
        (EngineKind::Xray, "windows", "x86_64") => "Xray-windows-64.zip",
        (EngineKind::Xray, "windows", "x86") => "Xray-windows-32.zip",
        (EngineKind::Xray, "macos", "x86_64") => "Xray-macos-64.zip",
        (EngineKind::Xray, "macos", "aarch64") => "Xray-macos-arm64.zip",

        (EngineKind::SingBox, "linux", "x86_64") => "sing-box-*-linux-amd64.tar.gz",
        (EngineKind::SingBox, "linux", "x86") => "sing-box-*-linux-386.tar.gz",
        (EngineKind::SingBox, "linux", "aarch64") => "sing-box-*-linux-arm64.tar.gz",
        (EngineKind::SingBox, "linux", "arm") => "sing-box-*-linux-armv7.tar.gz",
        (EngineKind::SingBox, "windows", "x86_64") => "sing-box-*-windows-amd64.zip",
        (EngineKind::SingBox, "windows", "x86") => "sing-box-*-windows-386.zip",
        (EngineKind::SingBox, "macos", "x86_64") => "sing-box-*-darwin-amd64.tar.gz",
        (EngineKind::SingBox, "macos", "aarch64") => "sing-box-*-darwin-arm64.tar.gz",

        (EngineKind::Clash, "linux", "x86_64") => "mihomo-linux-amd64-v*.gz",
        (EngineKind::Clash, "linux", "aarch64") => "mihomo-linux-arm64-v*.gz",
        (EngineKind::Clash, "windows", "x86_64") => "mihomo-windows-amd64-v*.zip",
        (EngineKind::Clash, "windows", "aarch64") => "mihomo-windows-arm64-v*.zip",
        (EngineKind::Clash, "macos", "x86_64") => "mihomo-darwin-amd64-v*.gz",
        (EngineKind::Clash, "macos", "aarch64") => "mihomo-darwin-arm64-v*.gz",

        _ => bail!("unsupported platform {}/{} for {} release asset", os, arch, engine),
    };
    let repo = match engine {
        EngineKind::Xray => "XTLS/Xray-core",
        EngineKind::SingBox => "SagerNet/sing-box",
        _ => "MetaCubeX/mihomo",
    };
    Ok((repo, template))
}

/// 返回 (下载地址, 资源名)
pub fn build_download_url(repo: &str, tag: &str, template: &str) -> (String, String) {
    let tag = if tag.starts_with('v') {
        tag.to_string()
    } else {
        format!("v{}", tag)
    };
    let asset = template.replace('*', tag.trim_start_matches('v'));
    let url = format!("https://github.com/{}/releases/download/{}/{}", repo, tag, asset);
    (url, asset)
}

pub struct GithubReleaseInstaller {
    downloader: Arc<dyn Downloader>,
    components: Arc<dyn ComponentRepository>,
    adapters: AdapterSet,
    paths: Paths,
    installing: Mutex<HashSet<String>>,
}

impl GithubReleaseInstaller {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        components: Arc<dyn ComponentRepository>,
        adapters: AdapterSet,
        paths: Paths,
    ) -> Self {
        Self {
            downloader,
            components,
            adapters,
            paths,
            installing: Mutex::new(HashSet::new()),
        }
    }

    async fn status(&self, id: &str, status: InstallStatus, progress: u8, message: &str) {
        if let Err(e) = self
            .components
            .update_install_status(id, status, progress, message)
            .await
        {
            warn!(component = id, error = %e, "update install status failed");
        }
    }

    async fn run(&self, comp: &CoreComponent) -> Result<()> {
        let id = comp.id.as_str();
        let engine = comp
            .kind
            .engine()
            .ok_or_else(|| anyhow!("unsupported component kind: {}", comp.kind.as_str()))?;
        let (repo, template) =
            release_source(engine, std::env::consts::OS, std::env::consts::ARCH)?;
        let repo = comp.meta.get("repo").map(String::as_str).unwrap_or(repo);

        self.status(id, InstallStatus::Downloading, 10, "正在获取下载地址...").await;
        let release = self
            .downloader
            .fetch_json(&format!("https://api.github.com/repos/{}/releases/latest", repo))
            .await
            .context("获取下载信息失败")?;
        let tag = release
            .get("tag_name")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("获取下载信息失败: release without tag_name"))?
            .to_string();
        let (url, asset) = build_download_url(repo, &tag, template);
        info!(component = %comp.name, version = %tag, url = %url, "installing component");

        self.status(id, InstallStatus::Downloading, 20, "正在下载...").await;
        let data = self.downloader.fetch(&url).await.context("下载失败")?;
        let checksum = sha256_hex(&data);

        self.status(id, InstallStatus::Extracting, 70, "正在解压安装...").await;
        let target = self.paths.core_dir(engine);
        let binaries = self
            .adapters
            .get(engine)
            .map(|a| a.binary_names())
            .unwrap_or(&[]);
        let data_for_extract = data;
        let target_for_extract = target.clone();
        let is_clash = engine == EngineKind::Clash;
        tokio::task::spawn_blocking(move || -> Result<()> {
            extract_archive(
                &target_for_extract,
                ArchiveKind::infer(&asset),
                &asset,
                &data_for_extract,
            )?;
            if is_clash {
                normalize_clash_binary(&target_for_extract).context("安装后处理失败")?;
            }
            mark_executable(&target_for_extract, binaries);
            Ok(())
        })
        .await
        .context("extract task")?
        .context("解压失败")?;

        if engine == EngineKind::SingBox {
            self.status(id, InstallStatus::Downloading, 85, "正在下载 rule-set...").await;
            rule_set::ensure_rule_sets(self.downloader.as_ref(), &self.paths.rule_set_dir(), &[])
                .await
                .context("rule-set 下载失败")?;
        }

        self.components
            .set_installed(id, &target.to_string_lossy(), &tag, &checksum)
            .await?;
        self.status(id, InstallStatus::Done, 100, "安装完成").await;
        info!(component = %comp.name, dir = %target.display(), "component installed");
        Ok(())
    }
}

#[async_trait]
impl ComponentInstaller for GithubReleaseInstaller {
    async fn install(&self, component_id: &str) -> Result<()> {
        {
            let mut installing = self
                .installing
                .lock()
                .map_err(|_| anyhow!("installer lock poisoned"))?;
            if !installing.insert(component_id.to_string()) {
                return Ok(());
            }
        }

        let result = match self.components.get(component_id).await {
            Ok(comp) => self.run(&comp).await,
            Err(e) => Err(anyhow::Error::new(e)),
        };
        if let Err(e) = &result {
            warn!(component = component_id, error = %format!("{:#}", e), "component install failed");
            self.status(component_id, InstallStatus::Error, 0, &format!("{:#}", e))
                .await;
        }

        if let Ok(mut installing) = self.installing.lock() {
            installing.remove(component_id);
        }
        result
    }
}

// ─── 解压 ───

/// 解压到 `<target>.tmp` 后整体替换 `target`
pub fn extract_archive(target: &Path, kind: ArchiveKind, asset: &str, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("install dir has no parent: {}", target.display()))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if tmp.exists() {
        std::fs::remove_dir_all(&tmp)?;
    }
    std::fs::create_dir_all(&tmp)?;

    let extracted = match kind {
        ArchiveKind::Zip => extract_zip(data, &tmp),
        ArchiveKind::TarGz => extract_tar_gz(data, &tmp),
        ArchiveKind::Gz => {
            let name = asset.trim_end_matches(".gz");
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .context("gunzip")
                .and_then(|_| fsutil::write_atomic(&tmp.join(name), &out))
        }
        ArchiveKind::Raw => fsutil::write_atomic(&tmp.join(asset), data),
    };
    if let Err(e) = extracted {
        let _ = std::fs::remove_dir_all(&tmp);
        return Err(e);
    }

    // 保留 rule-set 等运行期数据
    if target.exists() {
        preserve_runtime_entries(target, &tmp)?;
        std::fs::remove_dir_all(target)?;
    }
    std::fs::rename(&tmp, target)
        .with_context(|| format!("rename {} -> {}", tmp.display(), target.display()))?;
    Ok(())
}

fn preserve_runtime_entries(old: &Path, new: &Path) -> Result<()> {
    for name in ["rule-set", "config.json", "config.yaml", "config.explain.txt"] {
        let from = old.join(name);
        let to = new.join(name);
        if from.exists() && !to.exists() {
            std::fs::rename(&from, &to)
                .with_context(|| format!("keep {} across reinstall", from.display()))?;
        }
    }
    Ok(())
}

fn extract_zip(data: &[u8], dir: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).context("open zip")?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let rel = file
            .enclosed_name()
            .ok_or_else(|| anyhow!("invalid path traversal detected: {}", file.name()))?;
        let out = dir.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        std::fs::write(&out, &buf).with_context(|| format!("write {}", out.display()))?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            fsutil::set_mode(&out, mode & 0o777)?;
        }
    }
    Ok(())
}

fn extract_tar_gz(data: &[u8], dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    for entry in archive.entries().context("read tar")? {
        let mut entry = entry?;
        // unpack_in 拒绝越出目录的路径
        if !entry.unpack_in(dir)? {
            let path = entry.path()?.display().to_string();
            bail!("invalid path traversal detected: {}", path);
        }
    }
    Ok(())
}

/// mihomo 发布包里的文件名带平台与版本后缀，统一改名为 `mihomo`
pub fn normalize_clash_binary(dir: &Path) -> Result<()> {
    let target_name = if cfg!(windows) { "mihomo.exe" } else { "mihomo" };
    let target = dir.join(target_name);
    if target.is_file() {
        return Ok(());
    }

    let is_candidate = |p: &Path| {
        let lower = p
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if cfg!(windows) && !lower.ends_with(".exe") {
            return false;
        }
        p.is_file() && (lower.starts_with("mihomo") || lower.starts_with("clash"))
    };

    let mut dirs = vec![dir.to_path_buf()];
    dirs.extend(list_sorted(dir).into_iter().filter(|p| p.is_dir()));
    for d in dirs {
        if let Some(found) = list_sorted(&d).into_iter().find(|p| is_candidate(p)) {
            std::fs::rename(&found, &target)
                .with_context(|| format!("rename {} -> {}", found.display(), target.display()))?;
            #[cfg(unix)]
            fsutil::set_mode(&target, 0o755)?;
            return Ok(());
        }
    }
    bail!("clash binary not found after extraction in {}", dir.display())
}

fn list_sorted(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    entries.sort();
    entries
}

#[cfg(unix)]
fn mark_executable(dir: &Path, binaries: &[&str]) {
    if let Some(path) = fsutil::find_binary_in_dir(dir, binaries) {
        if let Err(e) = fsutil::set_mode(&path, 0o755) {
            warn!(path = %path.display(), error = %e, "chmod binary failed");
        }
    }
}

#[cfg(not(unix))]
fn mark_executable(_dir: &Path, _binaries: &[&str]) {}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::domain::ComponentKind;
    use crate::repository::{EventBus, MemoryStore};
    use crate::resources::testutil::StaticDownloader;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zip_with(name: &str, body: &[u8]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut buf);
            let opts = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
            w.start_file(name, opts).unwrap();
            w.write_all(body).unwrap();
            w.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn archive_kind_by_suffix() {
        assert_eq!(ArchiveKind::infer("sing-box-1.9.0-linux-amd64.tar.gz"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::infer("Xray-linux-64.zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::infer("mihomo-linux-amd64-v1.18.0.gz"), ArchiveKind::Gz);
        assert_eq!(ArchiveKind::infer("geoip.dat"), ArchiveKind::Raw);
    }

    #[test]
    fn url_from_template() {
        let (url, asset) =
            build_download_url("SagerNet/sing-box", "v1.9.3", "sing-box-*-linux-amd64.tar.gz");
        assert_eq!(asset, "sing-box-1.9.3-linux-amd64.tar.gz");
        assert_eq!(
            url,
            "https://github.com/SagerNet/sing-box/releases/download/v1.9.3/sing-box-1.9.3-linux-amd64.tar.gz"
        );
        let (_, asset) = build_download_url("MetaCubeX/mihomo", "1.18.0", "mihomo-linux-amd64-v*.gz");
        assert_eq!(asset, "mihomo-linux-amd64-v1.18.0.gz");
    }

    #[test]
    fn unsupported_platform_errors() {
        assert!(release_source(EngineKind::Clash, "linux", "x86").is_err());
        assert!(release_source(EngineKind::Xray, "freebsd", "x86_64").is_err());
        let (repo, _) = release_source(EngineKind::Xray, "linux", "x86_64").unwrap();
        assert_eq!(repo, "XTLS/Xray-core");
    }

    #[test]
    fn gz_is_normalized_to_mihomo() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("core/clash");
        let asset = "mihomo-linux-amd64-v1.18.0.gz";
        extract_archive(&target, ArchiveKind::Gz, asset, &gzip(b"ELF")).unwrap();
        assert!(target.join("mihomo-linux-amd64-v1.18.0").is_file());

        normalize_clash_binary(&target).unwrap();
        let name = if cfg!(windows) { "mihomo.exe" } else { "mihomo" };
        assert_eq!(std::fs::read(target.join(name)).unwrap(), b"ELF");
    }

    #[test]
    fn reinstall_keeps_rule_sets() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("core/sing-box");
        std::fs::create_dir_all(target.join("rule-set")).unwrap();
        std::fs::write(target.join("rule-set/geoip-cn.srs"), b"srs").unwrap();
        std::fs::write(target.join("old-binary"), b"old").unwrap();

        extract_archive(&target, ArchiveKind::Zip, "x.zip", &zip_with("sing-box", b"new")).unwrap();
        assert!(target.join("rule-set/geoip-cn.srs").is_file());
        assert!(!target.join("old-binary").exists());
        assert_eq!(std::fs::read(target.join("sing-box")).unwrap(), b"new");
    }

    #[test]
    fn zip_rejects_traversal() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("core/xray");
        let err = extract_archive(&target, ArchiveKind::Zip, "x.zip", &zip_with("../evil", b"x"))
            .unwrap_err();
        assert!(err.to_string().contains("traversal"));
        assert!(!root.path().join("core/xray.tmp").exists());
    }

    #[tokio::test]
    async fn install_xray_records_component() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::with_roots(root.path().join("artifacts"), root.path().join("data"));
        let store = Arc::new(MemoryStore::new(EventBus::default()));
        let comp =
            ComponentRepository::create(store.as_ref(), CoreComponent::new("xray", ComponentKind::Xray))
                .await
                .unwrap();

        let Ok((repo, template)) =
            release_source(EngineKind::Xray, std::env::consts::OS, std::env::consts::ARCH)
        else {
            return;
        };
        let (url, _) = build_download_url(repo, "v1.8.4", template);
        let dl = StaticDownloader::default()
            .with(
                &format!("https://api.github.com/repos/{}/releases/latest", repo),
                br#"{"tag_name":"v1.8.4"}"#.to_vec(),
            )
            .with(&url, zip_with("xray", b"bin"));

        let installer = GithubReleaseInstaller::new(
            Arc::new(dl),
            store.clone(),
            AdapterSet::defaults(),
            paths.clone(),
        );
        installer.install(&comp.id).await.unwrap();

        let comp = ComponentRepository::get(store.as_ref(), &comp.id).await.unwrap();
        assert!(comp.is_installed());
        assert_eq!(comp.install_status, InstallStatus::Done);
        assert_eq!(comp.last_version, "v1.8.4");
        assert_eq!(comp.checksum.len(), 64);
        assert!(paths.core_dir(EngineKind::Xray).join("xray").is_file());
    }

    #[tokio::test]
    async fn failed_download_marks_error() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::with_roots(root.path().join("artifacts"), root.path().join("data"));
        let store = Arc::new(MemoryStore::new(EventBus::default()));
        let comp = ComponentRepository::create(
            store.as_ref(),
            CoreComponent::new("sing-box", ComponentKind::Singbox),
        )
        .await
        .unwrap();

        let installer = GithubReleaseInstaller::new(
            Arc::new(StaticDownloader::default()),
            store.clone(),
            AdapterSet::defaults(),
            paths,
        );
        assert!(installer.install(&comp.id).await.is_err());
        let comp = ComponentRepository::get(store.as_ref(), &comp.id).await.unwrap();
        assert_eq!(comp.install_status, InstallStatus::Error);
        assert!(!comp.is_installed());
        assert!(!comp.install_message.is_empty());
    }
}
