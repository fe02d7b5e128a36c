//! release 查询与资产下载
//!
//! 通过 release 托管服务的 HTTP API 查询 release，流式下载资产。
//! HTTP 传输通过构造参数注入，测试时可替换为内存实现。

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{RegistryError, Result};
use super::platform::Platform;
use super::types::{Release, ReleaseAsset};
use super::version::{compare_versions, tag_candidates, VersionConstraint};
use crate::config::RegistryConfig;
use crate::logger::sanitize_log_message;

/// 查询 release 列表时每页数量
const RELEASES_PER_PAGE: usize = 100;

const ACCEPT_JSON: &str = "application/vnd.github.v3+json";
const ACCEPT_BINARY: &str = "application/octet-stream";

/// 响应体字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// HTTP 响应
pub struct HttpResponse {
    /// 状态码
    pub status: u16,
    /// Content-Length 响应头
    pub content_length: Option<u64>,
    /// 响应体
    pub body: ByteStream,
}

impl HttpResponse {
    /// 读取完整响应体，只用于小的 JSON 响应
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        let mut body = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RegistryError::Network(e.to_string()))?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }
}

/// HTTP 传输
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// 发起 GET 请求
    async fn get(&self, url: &str, accept: &str) -> Result<HttpResponse>;
}

/// 基于 reqwest 的 HTTP 传输
pub struct ReqwestTransport {
    client: reqwest::Client,
    token: Option<String>,
}

impl ReqwestTransport {
    /// 按配置创建
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RegistryError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            token: config.github_token.clone(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, accept: &str) -> Result<HttpResponse> {
        debug!("GET {}", sanitize_log_message(url));

        let mut request = self.client.get(url).header("Accept", accept);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            RegistryError::Network(sanitize_log_message(&format!("请求 {} 失败: {}", url, e)))
        })?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

        Ok(HttpResponse {
            status,
            content_length,
            body: Box::pin(body),
        })
    }
}

/// 下载进度回调: (已下载字节, 总字节)
pub type DownloadProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// release 客户端
#[derive(Clone)]
pub struct ReleaseClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
}

impl ReleaseClient {
    /// 使用指定传输创建
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// 按配置创建 reqwest 客户端
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), config.api_base_url.clone()))
    }

    /// 获取最新 release
    pub async fn get_latest_release(&self, owner: &str, repo: &str) -> Result<Release> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.base_url, owner, repo);
        self.get_json(&url, &format!("{}/{}@latest", owner, repo))
            .await
    }

    /// 按 tag 获取 release
    pub async fn get_release_by_tag(&self, owner: &str, repo: &str, tag: &str) -> Result<Release> {
        let url = format!(
            "{}/repos/{}/{}/releases/tags/{}",
            self.base_url, owner, repo, tag
        );
        self.get_json(&url, &format!("{}/{}@{}", owner, repo, tag))
            .await
    }

    /// 列出稳定 release，最新的在前，最多 `limit` 个 (`0` 表示不限)
    pub async fn list_stable_releases(
        &self,
        owner: &str,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<Release>> {
        let url = format!(
            "{}/repos/{}/{}/releases?per_page={}",
            self.base_url, owner, repo, RELEASES_PER_PAGE
        );
        let releases: Vec<Release> = self
            .get_json(&url, &format!("{}/{}", owner, repo))
            .await?;

        let mut stable: Vec<Release> = releases.into_iter().filter(Release::is_stable).collect();
        if stable.iter().all(|r| r.published_at.is_some()) {
            stable.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        }
        if limit > 0 {
            stable.truncate(limit);
        }
        Ok(stable)
    }

    /// 流式下载资产到 `dest`，返回写入的字节数
    ///
    /// 失败或取消时删除已写入的部分文件
    pub async fn download_asset(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<DownloadProgress<'_>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        info!("开始下载: {} -> {}", sanitize_log_message(url), dest.display());

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            response = self.transport.get(url, ACCEPT_BINARY) => response?,
        };
        check_status(response.status, url)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let total = response.content_length;
        let mut file = fs::File::create(dest).await?;

        let result = stream_to_file(response.body, &mut file, total, progress, cancel).await;
        drop(file);

        match result {
            Ok(downloaded) => {
                info!("下载完成: {} ({} bytes)", dest.display(), downloaded);
                Ok(downloaded)
            }
            Err(e) => {
                let _ = fs::remove_file(dest).await;
                Err(e)
            }
        }
    }

    /// 查找带有兼容资产的 release
    ///
    /// - `version` 为空：在稳定 release 中从新到旧找第一个有兼容资产的
    /// - `version` 非空：先取对应 tag；该 release 没有兼容资产时回退到稳定 release 列表
    pub async fn find_release_with_asset(
        &self,
        owner: &str,
        repo: &str,
        version: &str,
        name_prefix: &str,
        platform: &Platform,
    ) -> Result<(Release, ReleaseAsset)> {
        let version = version.trim();
        if version.is_empty() {
            let releases = self.list_stable_releases(owner, repo, 0).await?;
            if releases.is_empty() {
                return Err(RegistryError::ReleaseNotFound(format!(
                    "{}/{}: 没有稳定版本",
                    owner, repo
                )));
            }
            return first_with_asset(releases, name_prefix, platform)
                .ok_or_else(|| no_compatible_asset(owner, repo, platform));
        }

        let release = self.get_release_with_tag_variants(owner, repo, version).await?;
        if let Some(asset) = find_compatible_asset(&release, name_prefix, platform) {
            let asset = asset.clone();
            return Ok((release, asset));
        }

        warn!(
            "{}/{}@{} 没有 {} 平台的资产，回退到其他稳定版本",
            owner, repo, release.tag_name, platform
        );
        let releases = self.list_stable_releases(owner, repo, 0).await?;
        let found = first_with_asset(releases, name_prefix, platform)
            .ok_or_else(|| no_compatible_asset(owner, repo, platform))?;
        info!(
            "{}/{}: 使用 {} 代替 {}",
            owner, repo, found.0.tag_name, release.tag_name
        );
        Ok(found)
    }

    /// 在稳定 release 中找满足约束且有兼容资产的最新版本
    pub async fn find_release_matching(
        &self,
        owner: &str,
        repo: &str,
        constraint: &VersionConstraint,
        name_prefix: &str,
        platform: &Platform,
    ) -> Result<(Release, ReleaseAsset)> {
        let releases = self.list_stable_releases(owner, repo, 0).await?;
        let mut candidates: Vec<Release> = releases
            .into_iter()
            .filter(|r| {
                super::version::parse_version(&r.tag_name)
                    .map(|v| constraint.matches(&v))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort_by(|a, b| {
            compare_versions(&b.tag_name, &a.tag_name).unwrap_or(std::cmp::Ordering::Equal)
        });

        if candidates.is_empty() {
            return Err(RegistryError::ReleaseNotFound(format!(
                "{}/{}: 没有满足 {} 的稳定版本",
                owner, repo, constraint
            )));
        }
        first_with_asset(candidates, name_prefix, platform)
            .ok_or_else(|| no_compatible_asset(owner, repo, platform))
    }

    /// 按 tag 获取 release，依次尝试 `v` 前缀和补齐后的写法
    async fn get_release_with_tag_variants(
        &self,
        owner: &str,
        repo: &str,
        version: &str,
    ) -> Result<Release> {
        let mut first_miss = None;
        for tag in tag_candidates(version) {
            match self.get_release_by_tag(owner, repo, &tag).await {
                Err(RegistryError::ReleaseNotFound(context)) => {
                    debug!("tag {} 不存在", tag);
                    first_miss.get_or_insert(context);
                }
                other => return other,
            }
        }
        Err(RegistryError::ReleaseNotFound(
            first_miss.unwrap_or_else(|| format!("{}/{}@{}", owner, repo, version)),
        ))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, context: &str) -> Result<T> {
        let response = self.transport.get(url, ACCEPT_JSON).await.map_err(|e| match e {
            RegistryError::Network(message) => {
                RegistryError::Network(format!("{}: {}", context, message))
            }
            other => other,
        })?;
        check_status(response.status, context)?;
        let body = response.into_bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Network(format!("{}: 解析响应失败: {}", context, e)))
    }
}

/// release 中名称前缀和平台都匹配的资产
pub fn find_compatible_asset<'a>(
    release: &'a Release,
    name_prefix: &str,
    platform: &Platform,
) -> Option<&'a ReleaseAsset> {
    let prefix = name_prefix.to_lowercase();
    release.assets.iter().find(|asset| {
        asset.name.to_lowercase().starts_with(&prefix) && platform.matches_asset(&asset.name)
    })
}

fn first_with_asset(
    releases: Vec<Release>,
    name_prefix: &str,
    platform: &Platform,
) -> Option<(Release, ReleaseAsset)> {
    releases.into_iter().find_map(|release| {
        let asset = find_compatible_asset(&release, name_prefix, platform)?.clone();
        Some((release, asset))
    })
}

fn no_compatible_asset(owner: &str, repo: &str, platform: &Platform) -> RegistryError {
    RegistryError::NoCompatibleAsset {
        repository: format!("{}/{}", owner, repo),
        platform: platform.to_string(),
    }
}

/// 非 2xx 状态码映射为错误
fn check_status(status: u16, context: &str) -> Result<()> {
    match status {
        200..=299 => Ok(()),
        404 => Err(RegistryError::ReleaseNotFound(context.to_string())),
        403 => Err(RegistryError::RateLimited(context.to_string())),
        _ => Err(RegistryError::HttpStatus {
            status,
            context: sanitize_log_message(context),
        }),
    }
}

async fn stream_to_file(
    mut body: ByteStream,
    file: &mut fs::File,
    total: Option<u64>,
    progress: Option<DownloadProgress<'_>>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut downloaded: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk.map_err(|e| RegistryError::Network(format!("读取数据失败: {}", e)))?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if let Some(progress) = progress {
            progress(downloaded, total);
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(downloaded)
}
