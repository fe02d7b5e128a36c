//! 插件安装器
//!
//! 协调完整的安装流程：
//! 解析标识 → 加锁 → 解析 release/资产 → 下载 → 解压 → 校验 → 写入元数据 → 移动到最终位置。
//! 任一步失败都会释放锁并删除临时目录，不会留下安装了一半的版本目录。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::archive::{validate_binary_with, ArchiveExtractor, ExecutabilityChecker};
use super::error::{RegistryError, Result};
use super::lock::LockManager;
use super::metadata::{metadata_path, read_metadata, write_metadata, REPOSITORY_KEY};
use super::platform::Platform;
use super::release_client::ReleaseClient;
use super::scanner::{BinaryResolver, PluginScanner, LEGACY_NAME_PREFIX};
use super::types::{
    is_valid_plugin_name, CleanupResult, InstallOptions, InstallProgress, InstallResult,
    InstallStage, PluginSpecifier, ProgressCallback, Release, ReleaseAsset, RemoveOptions,
    RemoveResult, RepositoryRef, UpdateOptions, UpdateResult, METADATA_FILE_NAME,
    REPO_NAME_PREFIX,
};
use super::version::{
    compare_versions, is_valid_version, parse_version_constraint, tag_candidates, VersionConstraint,
};
use crate::config::{RegistryConfig, RegistryEntry};

/// 请求的版本
#[derive(Debug, Clone)]
enum VersionRequest {
    /// 最新稳定版
    Latest,
    /// 指定 tag
    Exact(String),
    /// 满足约束的最新稳定版
    Constraint(VersionConstraint),
}

impl VersionRequest {
    fn parse(version: Option<&str>) -> Result<Self> {
        match version.map(str::trim) {
            None | Some("") => Ok(Self::Latest),
            Some(v) if v.eq_ignore_ascii_case("latest") => Ok(Self::Latest),
            Some(v) if is_valid_version(v) => Ok(Self::Exact(v.to_string())),
            Some(v) => parse_version_constraint(v).map(Self::Constraint),
        }
    }

    fn as_requested(&self) -> Option<String> {
        match self {
            Self::Latest => None,
            Self::Exact(v) => Some(v.clone()),
            Self::Constraint(c) => Some(c.to_string()),
        }
    }
}

/// 一次安装的目标
#[derive(Debug, Clone)]
struct InstallTarget {
    name: String,
    repository: RepositoryRef,
    request: VersionRequest,
    asset_prefix: String,
}

/// 已解压并校验、尚未移动到最终位置的安装
struct StagedInstall {
    staging: TempDir,
    extract_dir: PathBuf,
    binary: PathBuf,
}

/// 插件安装器
#[derive(Clone)]
pub struct PluginInstaller {
    /// 插件根目录
    root: PathBuf,
    client: ReleaseClient,
    locks: LockManager,
    platform: Platform,
    resolver: BinaryResolver,
    extractor: ArchiveExtractor,
    /// 注册表索引
    registry: IndexMap<String, RegistryEntry>,
}

impl PluginInstaller {
    /// 创建安装器
    pub fn new(config: &RegistryConfig, client: ReleaseClient) -> Self {
        Self {
            root: config.plugin_root.clone(),
            client,
            locks: LockManager::new(config.plugin_root.clone()),
            platform: Platform::current(),
            resolver: BinaryResolver::new(config.legacy_binary_names),
            extractor: ArchiveExtractor::new(),
            registry: config.registry.clone(),
        }
    }

    /// 按配置创建，使用 reqwest 访问 release API
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        Ok(Self::new(config, ReleaseClient::from_config(config)?))
    }

    /// 指定目标平台
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// 指定锁管理器
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    /// 指定可执行性检测
    pub fn with_executability_checker(mut self, checker: Arc<dyn ExecutabilityChecker>) -> Self {
        self.resolver = self.resolver.with_checker(checker);
        self
    }

    /// 指定解压器
    pub fn with_extractor(mut self, extractor: ArchiveExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// 插件根目录
    pub fn plugin_root(&self) -> &Path {
        &self.root
    }

    /// 使用相同根目录和解析规则的扫描器
    pub fn scanner(&self) -> PluginScanner {
        PluginScanner::with_resolver(self.root.clone(), self.resolver.clone())
    }

    /// 安装插件
    ///
    /// `specifier` 为 `name[@version]` 或 `owner/repo[@version]`，
    /// 版本可以是 tag、版本约束或 `latest`
    pub async fn install(
        &self,
        specifier: &str,
        options: &InstallOptions,
        progress: &dyn ProgressCallback,
    ) -> Result<InstallResult> {
        let result = self.install_inner(specifier, options, progress).await;
        if let Err(e) = &result {
            warn!("安装 {} 失败: {}", specifier, e);
            progress.on_progress(InstallProgress::failed(e.to_string()));
        }
        result
    }

    async fn install_inner(
        &self,
        specifier: &str,
        options: &InstallOptions,
        progress: &dyn ProgressCallback,
    ) -> Result<InstallResult> {
        // 阶段 1: 解析标识，不做任何 I/O
        let target = self.resolve_target(specifier)?;
        progress.on_progress(InstallProgress::new(
            InstallStage::Parsed,
            0,
            format!("安装 {} (来源 {})", target.name, target.repository.slug()),
        ));

        // 阶段 2: 获取插件锁
        let guard = self.locks.acquire(&target.name)?;
        progress.on_progress(InstallProgress::new(InstallStage::Locked, 5, "已获取插件锁"));

        // 阶段 3: 指定了具体版本时先检查是否已安装，避免重复下载
        if !options.force {
            if let VersionRequest::Exact(version) = &target.request {
                if let Some(installed) = self.installed_version(&target.name, version) {
                    return Err(RegistryError::AlreadyInstalled {
                        name: target.name,
                        version: installed,
                    });
                }
            }
        }

        // 阶段 4: 解析 release 和资产
        let (release, asset) = self.resolve_release(&target).await?;
        ensure_version_dir_name(&release.tag_name)?;
        if !options.force && self.has_binary(&target.name, &release.tag_name) {
            return Err(RegistryError::AlreadyInstalled {
                name: target.name,
                version: release.tag_name,
            });
        }
        progress.on_progress(InstallProgress::new(
            InstallStage::Resolved,
            10,
            format!("{}@{}: {}", target.repository.slug(), release.tag_name, asset.name),
        ));

        // 阶段 5: 下载、解压、校验
        let mut metadata = options.metadata.clone();
        metadata
            .entry(REPOSITORY_KEY.to_string())
            .or_insert_with(|| target.repository.slug());
        let staged = self
            .stage_release(&target.name, &asset, &metadata, &options.cancel, progress)
            .await?;

        // 阶段 6: 移动到最终位置
        let binary = self.commit(&target.name, &release.tag_name, staged)?;
        progress.on_progress(InstallProgress::new(
            InstallStage::Installed,
            95,
            format!("已安装到 {}", binary.display()),
        ));

        // 阶段 7: 清理其他版本
        let removed_versions = if options.clean_other_versions {
            self.cleanup_versions(&target.name, &release.tag_name, Some(progress))?
                .removed_versions
        } else {
            Vec::new()
        };

        guard.release()?;
        info!(
            "插件 {} {} 安装成功: {}",
            target.name,
            release.tag_name,
            binary.display()
        );
        progress.on_progress(InstallProgress::new(
            InstallStage::Installed,
            100,
            format!("插件 {} {} 安装成功", target.name, release.tag_name),
        ));

        Ok(InstallResult {
            name: target.name,
            version: release.tag_name,
            requested_version: target.request.as_requested(),
            path: binary,
            repository: target.repository.slug(),
            asset_name: asset.name,
            removed_versions,
        })
    }

    /// 更新插件到最新兼容版本
    ///
    /// 远端版本不高于已安装版本时报告 `was_up_to_date`，不会降级
    pub async fn update(
        &self,
        name: &str,
        options: &UpdateOptions,
        progress: &dyn ProgressCallback,
    ) -> Result<UpdateResult> {
        let result = self.update_inner(name, options, progress).await;
        if let Err(e) = &result {
            warn!("更新 {} 失败: {}", name, e);
            progress.on_progress(InstallProgress::failed(e.to_string()));
        }
        result
    }

    async fn update_inner(
        &self,
        name: &str,
        options: &UpdateOptions,
        progress: &dyn ProgressCallback,
    ) -> Result<UpdateResult> {
        let current = self.scanner().get_latest_plugin(name)?.plugin;
        let target = self.update_target(name, options, current.metadata.as_ref())?;
        progress.on_progress(InstallProgress::new(
            InstallStage::Parsed,
            0,
            format!("检查 {} 的更新 (当前 {})", name, current.version),
        ));

        let guard = self.locks.acquire(name)?;
        progress.on_progress(InstallProgress::new(InstallStage::Locked, 5, "已获取插件锁"));

        let (release, asset) = self.resolve_release(&target).await?;
        progress.on_progress(InstallProgress::new(
            InstallStage::Resolved,
            10,
            format!("{}@{}: {}", target.repository.slug(), release.tag_name, asset.name),
        ));

        if compare_versions(&release.tag_name, &current.version)? != Ordering::Greater {
            info!("插件 {} 已是最新版本 {}", name, current.version);
            return Ok(UpdateResult {
                name: name.to_string(),
                new_version: current.version.clone(),
                old_version: current.version,
                was_up_to_date: true,
                path: current.path,
            });
        }

        if options.dry_run {
            info!(
                "[dry run] 插件 {} 可以从 {} 更新到 {}",
                name, current.version, release.tag_name
            );
            return Ok(UpdateResult {
                name: name.to_string(),
                old_version: current.version,
                new_version: release.tag_name,
                was_up_to_date: false,
                path: current.path,
            });
        }

        ensure_version_dir_name(&release.tag_name)?;
        let mut metadata = current.metadata.clone().unwrap_or_default();
        metadata.insert(REPOSITORY_KEY.to_string(), target.repository.slug());
        let staged = self
            .stage_release(name, &asset, &metadata, &options.cancel, progress)
            .await?;
        let binary = self.commit(name, &release.tag_name, staged)?;

        guard.release()?;
        info!(
            "插件 {} 已从 {} 更新到 {}",
            name, current.version, release.tag_name
        );
        progress.on_progress(InstallProgress::new(
            InstallStage::Installed,
            100,
            format!("插件 {} 已更新到 {}", name, release.tag_name),
        ));

        Ok(UpdateResult {
            name: name.to_string(),
            old_version: current.version,
            new_version: release.tag_name,
            was_up_to_date: false,
            path: binary,
        })
    }

    /// 删除插件
    ///
    /// `keep_config` 时保留各版本目录下的 plugin.metadata.json；
    /// 指定 `version` 时只删除该版本
    pub fn remove(&self, name: &str, options: &RemoveOptions) -> Result<RemoveResult> {
        ensure_plugin_name(name)?;
        let plugin_dir = self.root.join(name);
        if !plugin_dir.is_dir() {
            return Err(RegistryError::PluginNotFound(name.to_string()));
        }

        let guard = self.locks.acquire(name)?;

        let versions: Vec<String> = match &options.version {
            Some(version) => {
                let dir = self
                    .find_version_dir(name, version)
                    .ok_or_else(|| RegistryError::PluginNotFound(format!("{}@{}", name, version)))?;
                vec![dir]
            }
            None => list_version_dirs(&plugin_dir)?,
        };

        let mut kept_config_files = Vec::new();
        for version in &versions {
            let version_dir = plugin_dir.join(version);
            let metadata_file = metadata_path(&version_dir);
            if options.keep_config && metadata_file.is_file() {
                remove_all_except(&version_dir, METADATA_FILE_NAME)?;
                kept_config_files.push(metadata_file);
            } else {
                fs::remove_dir_all(&version_dir)?;
            }
            debug!("已删除 {}@{}", name, version);
        }

        if options.version.is_none() && kept_config_files.is_empty() {
            fs::remove_dir_all(&plugin_dir)?;
        } else {
            // 目录已空时顺带删除
            let _ = fs::remove_dir(&plugin_dir);
        }

        guard.release()?;
        info!("已删除插件 {}: {:?}", name, versions);

        Ok(RemoveResult {
            name: name.to_string(),
            removed_versions: versions,
            kept_config_files,
        })
    }

    /// 删除 `keep_version` 以外的所有版本目录
    ///
    /// 需要插件锁；`keep_version` 必须已安装
    pub fn remove_other_versions(
        &self,
        name: &str,
        keep_version: &str,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<CleanupResult> {
        ensure_plugin_name(name)?;
        let guard = self.locks.acquire(name)?;
        let result = self.cleanup_versions(name, keep_version, progress)?;
        guard.release()?;
        Ok(result)
    }

    /// 调用方必须已持有插件锁
    fn cleanup_versions(
        &self,
        name: &str,
        keep_version: &str,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<CleanupResult> {
        let plugin_dir = self.root.join(name);
        let keep_version = self.find_version_dir(name, keep_version).ok_or_else(|| {
            RegistryError::PluginNotFound(format!("{}@{}", name, keep_version))
        })?;

        let mut result = CleanupResult::default();
        for entry in fs::read_dir(&plugin_dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if !file_type.is_dir() {
                continue;
            }
            let Ok(version) = entry.file_name().into_string() else {
                continue;
            };
            if version == keep_version {
                continue;
            }

            let path = entry.path();
            let size = dir_size(&path)?;
            fs::remove_dir_all(&path)?;
            debug!("已删除旧版本 {}@{} ({} bytes)", name, version, size);

            if let Some(progress) = progress {
                progress.on_progress(InstallProgress::new(
                    InstallStage::Cleanup,
                    95,
                    format!("已删除 {}@{}", name, version),
                ));
            }
            result.bytes_freed += size;
            result.removed_versions.push(version);
        }

        result.removed_versions.sort();
        info!(
            "插件 {} 清理了 {} 个旧版本，释放 {} bytes",
            name,
            result.removed_versions.len(),
            result.bytes_freed
        );
        Ok(result)
    }

    /// 解析标识得到安装目标
    fn resolve_target(&self, specifier: &str) -> Result<InstallTarget> {
        match PluginSpecifier::parse(specifier)? {
            PluginSpecifier::Registry { name, version } => {
                let entry = self
                    .registry
                    .get(&name)
                    .ok_or_else(|| RegistryError::PluginNotFound(name.clone()))?;
                let repository = entry.repository_ref()?;
                let asset_prefix = entry
                    .asset_prefix
                    .clone()
                    .unwrap_or_else(|| repository.repo.clone());
                Ok(InstallTarget {
                    name,
                    request: VersionRequest::parse(version.as_deref())?,
                    repository,
                    asset_prefix,
                })
            }
            PluginSpecifier::Repository(repository) => {
                let name = repository.plugin_name();
                if !is_valid_plugin_name(&name) {
                    return Err(RegistryError::invalid_specifier(
                        specifier,
                        format!("无法由仓库名推导插件名: {}", name),
                    ));
                }
                Ok(InstallTarget {
                    name,
                    request: VersionRequest::parse(repository.version.as_deref())?,
                    asset_prefix: repository.repo.clone(),
                    repository,
                })
            }
        }
    }

    /// 更新时的来源：显式指定 > 注册表索引 > 安装时记录的元数据
    fn update_target(
        &self,
        name: &str,
        options: &UpdateOptions,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<InstallTarget> {
        let (repository, asset_prefix) = if let Some(repository) = &options.repository {
            let repository = RepositoryRef::parse(repository)?;
            let prefix = repository.repo.clone();
            (repository, prefix)
        } else if let Some(entry) = self.registry.get(name) {
            let repository = entry.repository_ref()?;
            let prefix = entry
                .asset_prefix
                .clone()
                .unwrap_or_else(|| repository.repo.clone());
            (repository, prefix)
        } else if let Some(recorded) = metadata.and_then(|m| m.get(REPOSITORY_KEY)) {
            let repository = RepositoryRef::parse(recorded)?;
            let prefix = repository.repo.clone();
            (repository, prefix)
        } else {
            return Err(RegistryError::PluginNotFound(format!(
                "{}: 无法确定来源仓库",
                name
            )));
        };

        let version = options.version.as_deref().or(repository.version.as_deref());
        Ok(InstallTarget {
            name: name.to_string(),
            request: VersionRequest::parse(version)?,
            repository,
            asset_prefix,
        })
    }

    async fn resolve_release(&self, target: &InstallTarget) -> Result<(Release, ReleaseAsset)> {
        let RepositoryRef { owner, repo, .. } = &target.repository;
        match &target.request {
            VersionRequest::Latest => {
                self.client
                    .find_release_with_asset(owner, repo, "", &target.asset_prefix, &self.platform)
                    .await
            }
            VersionRequest::Exact(version) => {
                self.client
                    .find_release_with_asset(
                        owner,
                        repo,
                        version,
                        &target.asset_prefix,
                        &self.platform,
                    )
                    .await
            }
            VersionRequest::Constraint(constraint) => {
                self.client
                    .find_release_matching(
                        owner,
                        repo,
                        constraint,
                        &target.asset_prefix,
                        &self.platform,
                    )
                    .await
            }
        }
    }

    /// 在插件根目录内的临时目录中下载、解压并校验
    ///
    /// 返回的临时目录 drop 时自动删除
    async fn stage_release(
        &self,
        name: &str,
        asset: &ReleaseAsset,
        metadata: &HashMap<String, String>,
        cancel: &CancellationToken,
        progress: &dyn ProgressCallback,
    ) -> Result<StagedInstall> {
        let archive_name = asset_file_name(&asset.name)?;
        fs::create_dir_all(&self.root)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)?;

        // 下载
        let archive_path = staging.path().join(archive_name);
        let report = |downloaded: u64, total: Option<u64>| {
            progress.on_progress(InstallProgress::downloading(downloaded, total));
        };
        self.client
            .download_asset(&asset.download_url, &archive_path, Some(&report), cancel)
            .await?;
        progress.on_progress(InstallProgress::new(
            InstallStage::Downloaded,
            70,
            format!("已下载 {}", asset.name),
        ));

        // 解压
        let extract_dir = staging.path().join("extract");
        let extractor = self.extractor.clone();
        let (source, dest, token) = (archive_path.clone(), extract_dir.clone(), cancel.clone());
        tokio::task::spawn_blocking(move || extractor.extract_with_cancel(&source, &dest, &token))
            .await
            .map_err(|e| RegistryError::ExtractFailed(format!("解压任务异常: {}", e)))??;
        let _ = fs::remove_file(&archive_path);
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        progress.on_progress(InstallProgress::new(InstallStage::Extracted, 80, "解压完成"));

        // 校验
        let binary = self.locate_binary(&extract_dir, name, metadata)?;
        validate_binary_with(&binary, self.resolver.checker().as_ref())?;
        progress.on_progress(InstallProgress::new(
            InstallStage::Validated,
            90,
            format!("可执行文件校验通过: {}", file_name_of(&binary)),
        ));

        write_metadata(&extract_dir, metadata)?;

        Ok(StagedInstall {
            staging,
            extract_dir,
            binary,
        })
    }

    /// 把暂存的安装移动到 `<root>/<name>/<version>/`，返回最终的可执行文件路径
    ///
    /// 同名版本目录已存在 (force) 时先移入临时目录，移动失败则还原
    fn commit(&self, name: &str, version: &str, staged: StagedInstall) -> Result<PathBuf> {
        let plugin_dir = self.root.join(name);
        fs::create_dir_all(&plugin_dir)?;
        let version_dir = plugin_dir.join(version);

        let backup = staged.staging.path().join("previous");
        let replaced = match fs::rename(&version_dir, &backup) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = fs::rename(&staged.extract_dir, &version_dir) {
            if replaced {
                let _ = fs::rename(&backup, &version_dir);
            } else {
                let _ = fs::remove_dir(&plugin_dir);
            }
            return Err(e.into());
        }

        let relative = staged
            .binary
            .strip_prefix(&staged.extract_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(file_name_of(&staged.binary)));
        Ok(version_dir.join(relative))
    }

    /// 解析暂存目录中的可执行文件
    ///
    /// 约定名称的文件存在但不可执行时返回校验错误，而不是“未找到”
    fn locate_binary(
        &self,
        dir: &Path,
        name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PathBuf> {
        if let Some(binary) = self.resolver.resolve(dir, name, Some(metadata)) {
            return Ok(binary);
        }

        let suffix = self.platform.executable_suffix();
        let conventional = [
            name.to_string(),
            format!("{}{}", REPO_NAME_PREFIX, name),
            format!("{}{}", LEGACY_NAME_PREFIX, name),
        ];
        for stem in &conventional {
            for candidate in [dir.join(format!("{}{}", stem, suffix)), dir.join(stem)] {
                if candidate.exists() {
                    validate_binary_with(&candidate, self.resolver.checker().as_ref())?;
                }
            }
        }
        Err(RegistryError::BinaryNotFound(dir.to_path_buf()))
    }

    /// 已安装且能解析到可执行文件的版本目录名，`1.0.0` 与 `v1.0.0` 视为同一版本
    fn installed_version(&self, name: &str, version: &str) -> Option<String> {
        let dir = self.find_version_dir(name, version)?;
        self.has_binary(name, &dir).then_some(dir)
    }

    /// `1.2`、`v1.2.0` 和 `1.2.0` 都能找到 `v1.2.0` 目录
    fn find_version_dir(&self, name: &str, version: &str) -> Option<String> {
        let plugin_dir = self.root.join(name);
        tag_candidates(version)
            .into_iter()
            .find(|candidate| {
                ensure_version_dir_name(candidate).is_ok() && plugin_dir.join(candidate).is_dir()
            })
    }

    fn has_binary(&self, name: &str, version: &str) -> bool {
        let version_dir = self.root.join(name).join(version);
        if !version_dir.is_dir() {
            return false;
        }
        let metadata = read_metadata(&version_dir).ok();
        self.resolver
            .resolve(&version_dir, name, metadata.as_ref())
            .is_some()
    }
}

fn ensure_plugin_name(name: &str) -> Result<()> {
    if is_valid_plugin_name(name) {
        Ok(())
    } else {
        Err(RegistryError::invalid_specifier(name, "插件名称无效"))
    }
}

/// tag 会作为目录名使用
fn ensure_version_dir_name(version: &str) -> Result<()> {
    let valid = !version.is_empty()
        && !version.starts_with('.')
        && !version.contains(['/', '\\', '\0'])
        && !version.contains("..");
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidVersion(version.to_string()))
    }
}

/// 资产文件名不能带路径
fn asset_file_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(RegistryError::PathTraversal(name.to_string()));
    }
    Ok(name)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// 版本子目录名，跳过文件和隐藏条目
fn list_version_dirs(plugin_dir: &Path) -> Result<Vec<String>> {
    let mut versions = Vec::new();
    for entry in fs::read_dir(plugin_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            if !name.starts_with('.') {
                versions.push(name);
            }
        }
    }
    versions.sort();
    Ok(versions)
}

/// 删除目录中除 `keep` 以外的所有条目
fn remove_all_except(dir: &Path, keep: &str) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == keep {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// 递归计算占用大小，不跟随符号链接
fn dir_size(path: &Path) -> Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += dir_size(&entry?.path())?;
    }
    Ok(total)
}
