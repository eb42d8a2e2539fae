//! 运行时外部资源：sing-box rule-set、Clash geo 数据、内核组件安装
//!
//! 所有网络访问都经过 [`Downloader`]，测试里换成内存实现即可离线运行。

pub mod geodata;
pub mod installer;
pub mod rule_set;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

pub use geodata::ensure_clash_geodata;
pub use installer::{ComponentInstaller, GithubReleaseInstaller};
pub use rule_set::{ensure_rule_sets, rule_set_url};

/// 单次下载的最长时间
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait Downloader: Send + Sync {
    /// 下载整个响应体；非 2xx 视为错误
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// GitHub API 等需要 JSON 的场景
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        let body = self.fetch(url).await?;
        serde_json::from_slice(&body).with_context(|| format!("decode json from {}", url))
    }
}

/// reqwest 实现
#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(user_agent())
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "download start");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "*/*")
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        if !response.status().is_success() {
            bail!("HTTP {} for {}", response.status(), url);
        }
        let bytes = response.bytes().await?;
        debug!(url, size = bytes.len(), "download done");
        Ok(bytes.to_vec())
    }
}

pub fn user_agent() -> String {
    format!(
        "Vea/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// 小写十六进制 SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// 按 URL 返回预置内容，并记录请求顺序
    #[derive(Default)]
    pub struct StaticDownloader {
        pub responses: HashMap<String, Vec<u8>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl StaticDownloader {
        pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.responses.insert(url.to_string(), body.into());
            self
        }

        pub fn requested(&self) -> Vec<String> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Downloader for StaticDownloader {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            if let Ok(mut reqs) = self.requests.lock() {
                reqs.push(url.to_string());
            }
            match self.responses.get(url) {
                Some(body) => Ok(body.clone()),
                None => bail!("HTTP 404 Not Found for {}", url),
            }
        }
    }
}
