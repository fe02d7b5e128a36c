//! 插件注册表类型定义
//!
//! 定义插件标识、release、已安装插件记录、安装选项与进度类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use super::error::{RegistryError, Result};

/// 插件仓库名的约定前缀，`costlens-plugin-aws` 安装为 `aws`
pub const REPO_NAME_PREFIX: &str = "costlens-plugin-";

/// 元数据文件名
pub const METADATA_FILE_NAME: &str = "plugin.metadata.json";

/// release 源仓库引用 (`owner/repo[@version]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// 仓库 owner
    pub owner: String,
    /// 仓库名
    pub repo: String,
    /// 版本或版本约束
    pub version: Option<String>,
}

impl RepositoryRef {
    /// 解析 `owner/repo[@version]`
    ///
    /// 空输入或不含 `/` 的输入无效
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::invalid_specifier(input, "不能为空"));
        }
        if !trimmed.contains('/') {
            return Err(RegistryError::invalid_specifier(
                input,
                "期望 owner/repo[@version] 格式",
            ));
        }

        let (path, version) = split_version(input, trimmed)?;
        let mut parts = path.split('/');
        let owner = parts.next().unwrap_or_default().trim();
        let repo = parts.next().unwrap_or_default().trim();
        if parts.next().is_some() {
            return Err(RegistryError::invalid_specifier(input, "仓库路径只能包含一个 '/'"));
        }
        if owner.is_empty() || repo.is_empty() {
            return Err(RegistryError::invalid_specifier(input, "owner 和 repo 不能为空"));
        }
        if !is_valid_repo_component(owner) || !is_valid_repo_component(repo) {
            return Err(RegistryError::invalid_specifier(
                input,
                "owner 和 repo 只能包含字母、数字、连字符、下划线和点",
            ));
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            version,
        })
    }

    /// 由仓库名推导插件名
    pub fn plugin_name(&self) -> String {
        plugin_name_from_repo(&self.repo)
    }

    /// `owner/repo`
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}/{}@{}", self.owner, self.repo, version),
            None => write!(f, "{}/{}", self.owner, self.repo),
        }
    }
}

/// 用户输入的插件标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSpecifier {
    /// 注册表风格 `name[@version]`
    Registry {
        name: String,
        version: Option<String>,
    },
    /// 直接引用 release 源 `owner/repo[@version]`
    Repository(RepositoryRef),
}

impl PluginSpecifier {
    /// 解析插件标识，在任何 I/O 之前完成
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::invalid_specifier(input, "不能为空"));
        }
        if trimmed.contains('/') {
            return RepositoryRef::parse(trimmed).map(Self::Repository);
        }

        let (name, version) = split_version(input, trimmed)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::invalid_specifier(input, "插件名称不能为空"));
        }
        if !is_valid_plugin_name(name) {
            return Err(RegistryError::invalid_specifier(
                input,
                "插件名称只能包含字母、数字、连字符、下划线和点",
            ));
        }

        Ok(Self::Registry {
            name: name.to_string(),
            version,
        })
    }

    /// 请求的版本
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Registry { version, .. } => version.as_deref(),
            Self::Repository(repo) => repo.version.as_deref(),
        }
    }
}

/// 在最后一个 `@` 处拆分版本，`@` 后为空视为错误
fn split_version<'a>(input: &str, trimmed: &'a str) -> Result<(&'a str, Option<String>)> {
    match trimmed.rsplit_once('@') {
        Some((head, version)) => {
            let version = version.trim();
            if version.is_empty() {
                return Err(RegistryError::invalid_specifier(input, "'@' 后缺少版本"));
            }
            Ok((head, Some(version.to_string())))
        }
        None => Ok((trimmed, None)),
    }
}

/// 插件名称校验，名称会作为目录名和锁文件名使用
pub fn is_valid_plugin_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn is_valid_repo_component(part: &str) -> bool {
    part != "."
        && part != ".."
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// 去掉约定前缀得到插件名
pub fn plugin_name_from_repo(repo: &str) -> String {
    match repo.strip_prefix(REPO_NAME_PREFIX) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => repo.to_string(),
    }
}

/// release 资产
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// 文件名
    pub name: String,
    /// 下载 URL
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    /// 声明的文件大小 (bytes)
    #[serde(default)]
    pub size: u64,
}

/// release 记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// tag 名称
    pub tag_name: String,
    /// 显示名称
    #[serde(default)]
    pub name: Option<String>,
    /// 是否为草稿
    #[serde(default)]
    pub draft: bool,
    /// 是否为预发布
    #[serde(default)]
    pub prerelease: bool,
    /// 发布时间
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// 资产列表
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// 既不是草稿也不是预发布
    pub fn is_stable(&self) -> bool {
        !self.draft && !self.prerelease
    }
}

/// 已安装插件记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPlugin {
    /// 插件名称
    pub name: String,
    /// 版本 (版本目录名)
    pub version: String,
    /// 可执行文件绝对路径
    pub path: PathBuf,
    /// 可选元数据
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl InstalledPlugin {
    /// 读取元数据中的值
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

/// 安装阶段
///
/// 每次安装尝试依次经过这些阶段，任一步失败进入 `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStage {
    /// 标识已解析
    Parsed,
    /// 已获得锁
    Locked,
    /// release 和资产已确定
    Resolved,
    /// 下载中
    Downloading,
    /// 下载完成
    Downloaded,
    /// 解压完成
    Extracted,
    /// 可执行文件校验通过
    Validated,
    /// 安装完成
    Installed,
    /// 清理旧版本
    Cleanup,
    /// 失败
    Failed,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStage::Parsed => write!(f, "parsed"),
            InstallStage::Locked => write!(f, "locked"),
            InstallStage::Resolved => write!(f, "resolved"),
            InstallStage::Downloading => write!(f, "downloading"),
            InstallStage::Downloaded => write!(f, "downloaded"),
            InstallStage::Extracted => write!(f, "extracted"),
            InstallStage::Validated => write!(f, "validated"),
            InstallStage::Installed => write!(f, "installed"),
            InstallStage::Cleanup => write!(f, "cleanup"),
            InstallStage::Failed => write!(f, "failed"),
        }
    }
}

/// 安装进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallProgress {
    /// 当前阶段
    pub stage: InstallStage,
    /// 进度百分比 (0-100)
    pub percent: u8,
    /// 状态消息
    pub message: String,
}

impl InstallProgress {
    /// 创建新的进度实例
    pub fn new(stage: InstallStage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
        }
    }

    /// 下载进度，总大小未知时百分比为 0
    pub fn downloading(downloaded: u64, total: Option<u64>) -> Self {
        let percent = match total {
            Some(total) if total > 0 => ((downloaded.min(total) * 100) / total) as u8,
            _ => 0,
        };
        Self::new(
            InstallStage::Downloading,
            percent,
            format!("已下载 {} bytes", downloaded),
        )
    }

    /// 失败状态
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(InstallStage::Failed, 0, message)
    }
}

/// 进度回调 trait
pub trait ProgressCallback: Send + Sync {
    /// 进度更新回调
    fn on_progress(&self, progress: InstallProgress);
}

/// 空进度回调
pub struct NoopProgressCallback;

impl ProgressCallback for NoopProgressCallback {
    fn on_progress(&self, _progress: InstallProgress) {}
}

/// 将闭包包装为 ProgressCallback
pub struct FnProgressCallback<F>
where
    F: Fn(InstallProgress) + Send + Sync,
{
    callback: F,
}

impl<F> FnProgressCallback<F>
where
    F: Fn(InstallProgress) + Send + Sync,
{
    /// 创建新的函数回调
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressCallback for FnProgressCallback<F>
where
    F: Fn(InstallProgress) + Send + Sync,
{
    fn on_progress(&self, progress: InstallProgress) {
        (self.callback)(progress);
    }
}

/// 安装选项
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// 即使已安装也重新安装
    pub force: bool,
    /// 写入 plugin.metadata.json 的键值对 (如 region)
    pub metadata: HashMap<String, String>,
    /// 安装成功后删除其他版本
    pub clean_other_versions: bool,
    /// 取消信号
    pub cancel: CancellationToken,
}

/// 安装结果
#[derive(Debug, Clone)]
pub struct InstallResult {
    /// 插件名称
    pub name: String,
    /// 安装的版本 (release tag)
    pub version: String,
    /// 请求的版本
    pub requested_version: Option<String>,
    /// 可执行文件路径
    pub path: PathBuf,
    /// 来源仓库 `owner/repo`
    pub repository: String,
    /// 使用的资产文件名
    pub asset_name: String,
    /// 清理掉的旧版本
    pub removed_versions: Vec<String>,
}

impl InstallResult {
    /// 是否因请求版本缺少兼容资产而回退到了其他版本
    pub fn used_fallback(&self) -> bool {
        match &self.requested_version {
            Some(requested) => super::version::compare_versions(requested, &self.version)
                .map(|ord| ord != std::cmp::Ordering::Equal)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// 更新选项
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// 目标版本或版本约束，为空时取最新稳定版
    pub version: Option<String>,
    /// 只检查不安装
    pub dry_run: bool,
    /// 指定来源仓库 `owner/repo`，为空时查注册表索引
    pub repository: Option<String>,
    /// 取消信号
    pub cancel: CancellationToken,
}

/// 更新结果
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// 插件名称
    pub name: String,
    /// 更新前版本
    pub old_version: String,
    /// 更新后版本 (dry run 时为将要安装的版本)
    pub new_version: String,
    /// 是否已是最新
    pub was_up_to_date: bool,
    /// 新版本可执行文件路径 (dry run 或已是最新时为当前路径)
    pub path: PathBuf,
}

/// 删除选项
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// 保留 plugin.metadata.json
    pub keep_config: bool,
    /// 只删除指定版本
    pub version: Option<String>,
}

/// 删除结果
#[derive(Debug, Clone)]
pub struct RemoveResult {
    /// 插件名称
    pub name: String,
    /// 删除的版本
    pub removed_versions: Vec<String>,
    /// 保留的元数据文件
    pub kept_config_files: Vec<PathBuf>,
}

/// 清理其他版本的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// 删除的版本
    pub removed_versions: Vec<String>,
    /// 释放的字节数
    pub bytes_freed: u64,
}
