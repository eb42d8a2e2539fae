//! sing-box `.srs` rule-set 补齐
//!
//! 配置里引用的 rule-set 缺失时 sing-box 会直接退出，所以启动前缺什么补什么。

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use super::Downloader;
use crate::adapter::singbox::DEFAULT_RULE_SETS;
use crate::common::fsutil;

const GEOSITE_BASE: &str = "https://raw.githubusercontent.com/SagerNet/sing-geosite/rule-set/";
const GEOIP_BASE: &str = "https://raw.githubusercontent.com/SagerNet/sing-geoip/rule-set/";

pub fn rule_set_url(tag: &str) -> Result<String> {
    let tag = tag.trim().to_ascii_lowercase();
    let base = if tag.starts_with("geosite-") {
        GEOSITE_BASE
    } else if tag.starts_with("geoip-") {
        GEOIP_BASE
    } else {
        bail!("unknown sing-box rule-set tag: {}", tag);
    };
    Ok(format!("{}{}.srs", base, tag))
}

/// 下载 `dir` 中缺失或为空的 `<tag>.srs`；`tags` 为空时补默认集合。
/// 返回实际下载的标签。
pub async fn ensure_rule_sets(
    downloader: &dyn Downloader,
    dir: &Path,
    tags: &[String],
) -> Result<Vec<String>> {
    let tags: Vec<String> = if tags.is_empty() {
        DEFAULT_RULE_SETS.iter().map(|t| t.to_string()).collect()
    } else {
        tags.to_vec()
    };

    std::fs::create_dir_all(dir).with_context(|| format!("create rule-set dir {}", dir.display()))?;

    let mut fetched = Vec::new();
    for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        let target = dir.join(format!("{}.srs", tag));
        if std::fs::metadata(&target).map(|m| m.len() > 0).unwrap_or(false) {
            continue;
        }

        let url = rule_set_url(tag)?;
        let data = downloader
            .fetch(&url)
            .await
            .with_context(|| format!("download rule-set {}", tag))?;
        if data.is_empty() {
            bail!("download rule-set {}: empty payload", tag);
        }
        fsutil::write_atomic(&target, &data).with_context(|| format!("write rule-set {}", tag))?;
        info!(tag, path = %target.display(), "rule-set downloaded");
        fetched.push(tag.to_string());
    }
    Ok(fetched)
}
