//! Clash/mihomo 的 geo 数据
//!
//! mihomo 缺少 GeoIP.dat / GeoSite.dat / geoip.metadb 时会在启动期联网下载，
//! 这里提前从 `<artifacts>/geo` 复制，源文件缺失时先下载到 geo 目录。

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use super::Downloader;
use crate::common::fsutil;

const GEOIP_URLS: &[&str] = &[
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geoip.dat",
    "https://fastly.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release/geoip.dat",
];
const GEOSITE_URLS: &[&str] = &[
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geosite.dat",
    "https://fastly.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release/geosite.dat",
];
const METADB_URLS: &[&str] =
    &["https://fastly.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release/geoip.metadb"];

/// (geo 目录中的源文件, clash 目录中的目标文件, 下载地址)
const PAIRS: &[(&str, &str, &[&str])] = &[
    ("geoip.dat", "GeoIP.dat", GEOIP_URLS),
    ("geosite.dat", "GeoSite.dat", GEOSITE_URLS),
    ("geoip.metadb", "geoip.metadb", METADB_URLS),
];

/// 尽力而为：单个文件失败不影响其余文件，返回第一个错误
pub async fn ensure_clash_geodata(
    downloader: &dyn Downloader,
    geo_dir: &Path,
    config_dir: &Path,
) -> Result<()> {
    let mut first_err = None;
    for (src_name, dst_name, urls) in PAIRS {
        let dst = config_dir.join(dst_name);
        if dst.is_file() {
            continue;
        }
        let src = geo_dir.join(src_name);
        if let Err(e) = ensure_source(downloader, &src, urls).await {
            warn!(file = *src_name, error = %e, "clash geo data unavailable");
            first_err.get_or_insert(e);
            continue;
        }
        let data = std::fs::read(&src).with_context(|| format!("read {}", src.display()))?;
        fsutil::write_atomic(&dst, &data)?;
        debug!(src = %src.display(), dst = %dst.display(), "clash geo data copied");
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn ensure_source(downloader: &dyn Downloader, path: &Path, urls: &[&str]) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    let mut last_err = None;
    for url in urls {
        match downloader.fetch(url).await {
            Ok(data) if !data.is_empty() => return fsutil::write_atomic(path, &data),
            Ok(_) => last_err = Some(anyhow!("empty content from {}", url)),
            Err(e) => last_err = Some(e),
        }
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Err(last_err
        .unwrap_or_else(|| anyhow!("no source url"))
        .context(format!("download {}", name)))
}
