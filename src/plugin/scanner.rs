//! 已安装插件扫描
//!
//! 遍历 `<pluginRoot>/<name>/<version>/`，为每个版本目录解析可执行文件。
//! 扫描是只读的，不需要加锁；解析不到可执行文件的目录直接跳过。

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use semver::Version;
use tracing::{debug, warn};

use super::archive::{platform_checker, ExecutabilityChecker};
use super::error::{RegistryError, Result};
use super::metadata::{read_metadata, REGION_KEY};
use super::platform::Platform;
use super::types::{is_valid_plugin_name, InstalledPlugin, METADATA_FILE_NAME, REPO_NAME_PREFIX};
use super::version::parse_version;
use crate::config::RegistryConfig;

/// 旧版二进制命名前缀
pub const LEGACY_NAME_PREFIX: &str = "costpilot-plugin-";

/// 匹配时可用的上下文
pub struct MatchContext<'a> {
    /// 版本目录
    pub dir: &'a Path,
    /// 插件名称
    pub name: &'a str,
    /// 版本目录中的元数据
    pub metadata: Option<&'a HashMap<String, String>>,
    /// 可执行文件扩展名
    pub suffix: &'a str,
    /// 可执行性检测
    pub checker: &'a dyn ExecutabilityChecker,
}

impl MatchContext<'_> {
    /// 候选文件存在且可执行时返回路径
    fn candidate(&self, file_name: &str) -> Option<PathBuf> {
        let path = self.dir.join(file_name);
        let metadata = fs::metadata(&path).ok()?;
        self.checker.is_executable(&path, &metadata).then_some(path)
    }

    fn candidate_with_suffix(&self, stem: &str) -> Option<PathBuf> {
        if self.suffix.is_empty() {
            return self.candidate(stem);
        }
        self.candidate(&format!("{}{}", stem, self.suffix))
            .or_else(|| self.candidate(stem))
    }
}

/// 可执行文件匹配策略
pub trait BinaryMatcher: Send + Sync {
    /// 策略名称，用于日志
    fn name(&self) -> &'static str;

    /// 在版本目录中查找可执行文件
    fn find(&self, ctx: &MatchContext<'_>) -> Option<PathBuf>;
}

/// 与插件同名
pub struct ExactNameMatcher;

impl BinaryMatcher for ExactNameMatcher {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn find(&self, ctx: &MatchContext<'_>) -> Option<PathBuf> {
        ctx.candidate_with_suffix(ctx.name)
    }
}

/// `costlens-plugin-<name>`，元数据带 region 时优先 `costlens-plugin-<name>-<region>`
pub struct PrefixedNameMatcher;

impl BinaryMatcher for PrefixedNameMatcher {
    fn name(&self) -> &'static str {
        "prefixed"
    }

    fn find(&self, ctx: &MatchContext<'_>) -> Option<PathBuf> {
        let base = format!("{}{}", REPO_NAME_PREFIX, ctx.name);
        let region = ctx
            .metadata
            .and_then(|m| m.get(REGION_KEY))
            .map(|r| r.trim())
            .filter(|r| !r.is_empty());
        if let Some(region) = region {
            if let Some(path) = ctx.candidate_with_suffix(&format!("{}-{}", base, region)) {
                return Some(path);
            }
        }
        ctx.candidate_with_suffix(&base)
    }
}

/// 旧版命名 `costpilot-plugin-<name>`
pub struct LegacyNameMatcher;

impl BinaryMatcher for LegacyNameMatcher {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn find(&self, ctx: &MatchContext<'_>) -> Option<PathBuf> {
        ctx.candidate_with_suffix(&format!("{}{}", LEGACY_NAME_PREFIX, ctx.name))
    }
}

/// 目录中任意一个可执行文件 (按文件名排序取第一个)
pub struct AnyExecutableMatcher;

impl BinaryMatcher for AnyExecutableMatcher {
    fn name(&self) -> &'static str {
        "any-executable"
    }

    fn find(&self, ctx: &MatchContext<'_>) -> Option<PathBuf> {
        let mut names: Vec<String> = fs::read_dir(ctx.dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name != METADATA_FILE_NAME && !name.starts_with('.'))
            .collect();
        names.sort();
        names.into_iter().find_map(|name| ctx.candidate(&name))
    }
}

/// 按顺序尝试各个匹配策略
#[derive(Clone)]
pub struct BinaryResolver {
    matchers: Arc<Vec<Box<dyn BinaryMatcher>>>,
    checker: Arc<dyn ExecutabilityChecker>,
    suffix: &'static str,
}

impl BinaryResolver {
    /// 默认策略链，`legacy_names` 控制是否识别旧版命名
    pub fn new(legacy_names: bool) -> Self {
        let mut matchers: Vec<Box<dyn BinaryMatcher>> =
            vec![Box::new(ExactNameMatcher), Box::new(PrefixedNameMatcher)];
        if legacy_names {
            matchers.push(Box::new(LegacyNameMatcher));
        }
        matchers.push(Box::new(AnyExecutableMatcher));
        Self::with_matchers(matchers)
    }

    /// 自定义策略链
    pub fn with_matchers(matchers: Vec<Box<dyn BinaryMatcher>>) -> Self {
        Self {
            matchers: Arc::new(matchers),
            checker: platform_checker(),
            suffix: Platform::current().executable_suffix(),
        }
    }

    /// 替换可执行性检测
    pub fn with_checker(mut self, checker: Arc<dyn ExecutabilityChecker>) -> Self {
        self.checker = checker;
        self
    }

    /// 可执行性检测
    pub fn checker(&self) -> &Arc<dyn ExecutabilityChecker> {
        &self.checker
    }

    /// 在版本目录中解析插件可执行文件
    pub fn resolve(
        &self,
        dir: &Path,
        name: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Option<PathBuf> {
        let ctx = MatchContext {
            dir,
            name,
            metadata,
            suffix: self.suffix,
            checker: self.checker.as_ref(),
        };
        self.matchers.iter().find_map(|matcher| {
            let found = matcher.find(&ctx)?;
            debug!("[{}] {} -> {}", matcher.name(), name, found.display());
            Some(found)
        })
    }
}

/// 扫描过程中的非致命问题
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    /// 插件名称
    pub name: String,
    /// 版本目录名
    pub version: String,
    /// 说明
    pub message: String,
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}: {}", self.name, self.version, self.message)
    }
}

/// 每个插件的最新版本及警告
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// 每个插件名一条，按名称排序
    pub plugins: Vec<InstalledPlugin>,
    /// 被排除的版本
    pub warnings: Vec<ScanWarning>,
}

/// 单个插件的最新版本
#[derive(Debug, Clone)]
pub struct LatestPlugin {
    pub plugin: InstalledPlugin,
    pub warnings: Vec<ScanWarning>,
}

/// 已安装插件扫描器
#[derive(Clone)]
pub struct PluginScanner {
    root: PathBuf,
    resolver: BinaryResolver,
}

impl PluginScanner {
    /// 创建扫描器
    pub fn new(root: impl Into<PathBuf>, legacy_names: bool) -> Self {
        Self::with_resolver(root, BinaryResolver::new(legacy_names))
    }

    /// 按配置创建
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.plugin_root.clone(), config.legacy_binary_names)
    }

    /// 指定可执行文件解析器
    pub fn with_resolver(root: impl Into<PathBuf>, resolver: BinaryResolver) -> Self {
        Self {
            root: root.into(),
            resolver,
        }
    }

    /// 插件根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 列出所有已安装的 (插件, 版本)
    ///
    /// 根目录不存在时返回空列表
    pub fn list_plugins(&self) -> Result<Vec<InstalledPlugin>> {
        let root = absolute(&self.root)?;
        let mut plugins = Vec::new();
        for (name, name_dir) in read_subdirs(&root)? {
            plugins.extend(self.scan_plugin_dir(&name, &name_dir)?);
        }
        Ok(plugins)
    }

    /// 每个插件取语义版本最大的一条
    ///
    /// 版本号无效的条目不参与选择，以警告形式报告
    pub fn list_latest_plugins(&self) -> Result<ScanReport> {
        Ok(select_latest(self.list_plugins()?))
    }

    /// 指定插件的最新版本
    pub fn get_latest_plugin(&self, name: &str) -> Result<LatestPlugin> {
        if !is_valid_plugin_name(name) {
            return Err(RegistryError::invalid_specifier(name, "插件名称无效"));
        }
        let root = absolute(&self.root)?;
        let plugins = self.scan_plugin_dir(name, &root.join(name))?;
        let report = select_latest(plugins);
        match report.plugins.into_iter().next() {
            Some(plugin) => Ok(LatestPlugin {
                plugin,
                warnings: report.warnings,
            }),
            None => Err(RegistryError::PluginNotFound(name.to_string())),
        }
    }

    fn scan_plugin_dir(&self, name: &str, name_dir: &Path) -> Result<Vec<InstalledPlugin>> {
        let mut plugins = Vec::new();
        for (version, version_dir) in read_subdirs(name_dir)? {
            let metadata = match read_metadata(&version_dir) {
                Ok(metadata) => Some(metadata),
                Err(RegistryError::MetadataNotFound(_)) => None,
                Err(e) => {
                    warn!("忽略 {}@{} 的元数据: {}", name, version, e);
                    None
                }
            };

            match self.resolver.resolve(&version_dir, name, metadata.as_ref()) {
                Some(path) => plugins.push(InstalledPlugin {
                    name: name.to_string(),
                    version,
                    path,
                    metadata,
                }),
                None => debug!("{}@{} 中没有可执行文件，跳过", name, version),
            }
        }
        Ok(plugins)
    }
}

/// 按名称分组，保留最大版本
fn select_latest(plugins: Vec<InstalledPlugin>) -> ScanReport {
    let mut latest: IndexMap<String, (Version, InstalledPlugin)> = IndexMap::new();
    let mut warnings = Vec::new();

    for plugin in plugins {
        let version = match parse_version(&plugin.version) {
            Ok(version) => without_build(version),
            Err(e) => {
                warn!("{}@{} 版本号无效，不参与最新版本选择", plugin.name, plugin.version);
                warnings.push(ScanWarning {
                    name: plugin.name.clone(),
                    version: plugin.version.clone(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        let newer = latest
            .get(&plugin.name)
            .map(|(current, _)| version > *current)
            .unwrap_or(true);
        if newer {
            latest.insert(plugin.name.clone(), (version, plugin));
        }
    }

    latest.sort_keys();
    ScanReport {
        plugins: latest.into_values().map(|(_, plugin)| plugin).collect(),
        warnings,
    }
}

fn without_build(mut version: Version) -> Version {
    version.build = semver::BuildMetadata::EMPTY;
    version
}

/// 列出子目录，跳过以 `.` 开头的条目和普通文件 (如锁文件)
///
/// 结果按名称排序；目录不存在时返回空
fn read_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            dirs.push((name, path));
        }
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(dirs)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::{Path, PathBuf};

    /// 写入可执行文件
    pub fn write_executable(dir: &Path, file_name: &str) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(file_name);
        fs::write(&path, b"#!/bin/sh\necho plugin\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_executable;
    use super::*;
    use crate::plugin::archive::ModeBitsChecker;
    use crate::plugin::metadata::write_metadata;
    use tempfile::TempDir;

    fn resolver(legacy: bool) -> BinaryResolver {
        BinaryResolver::new(legacy).with_checker(Arc::new(ModeBitsChecker))
    }

    fn scanner(root: &Path) -> PluginScanner {
        PluginScanner::with_resolver(root, resolver(false))
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let scanner = scanner(&dir.path().join("missing"));
        assert!(scanner.list_plugins().unwrap().is_empty());
        assert!(scanner.list_latest_plugins().unwrap().plugins.is_empty());
    }

    #[test]
    fn test_list_plugins_skips_files_hidden_and_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_executable(&root.join("aws").join("v1.0.0"), "costlens-plugin-aws");
        fs::create_dir_all(root.join("aws").join("v0.9.0")).unwrap();
        fs::write(root.join("aws.lock"), "123").unwrap();
        write_executable(&root.join(".staging-x").join("v1.0.0"), "costlens-plugin-x");

        let plugins = scanner(root).list_plugins().unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "aws");
        assert_eq!(plugins[0].version, "v1.0.0");
        assert!(plugins[0].path.is_absolute());
        assert!(plugins[0].metadata.is_none());
    }

    #[test]
    fn test_matcher_order_prefers_exact_name() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("v1");
        write_executable(&version_dir, "aaa-helper");
        write_executable(&version_dir, "costlens-plugin-aws");
        write_executable(&version_dir, "aws");

        let found = resolver(false).resolve(&version_dir, "aws", None).unwrap();
        assert_eq!(found, version_dir.join("aws"));
    }

    #[test]
    fn test_region_suffixed_binary_preferred() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("v1");
        write_executable(&version_dir, "costlens-plugin-aws");
        write_executable(&version_dir, "costlens-plugin-aws-us-east-1");
        let metadata = HashMap::from([(REGION_KEY.to_string(), "us-east-1".to_string())]);

        let found = resolver(false)
            .resolve(&version_dir, "aws", Some(&metadata))
            .unwrap();
        assert_eq!(found, version_dir.join("costlens-plugin-aws-us-east-1"));

        let other = HashMap::from([(REGION_KEY.to_string(), "eu-west-1".to_string())]);
        let found = resolver(false)
            .resolve(&version_dir, "aws", Some(&other))
            .unwrap();
        assert_eq!(found, version_dir.join("costlens-plugin-aws"));
    }

    #[test]
    fn test_legacy_name_is_gated() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("v1");
        write_executable(&version_dir, "costpilot-plugin-aws");
        write_executable(&version_dir, "aaa-other");

        let default = resolver(false).resolve(&version_dir, "aws", None).unwrap();
        assert_eq!(default, version_dir.join("aaa-other"));

        let legacy = resolver(true).resolve(&version_dir, "aws", None).unwrap();
        assert_eq!(legacy, version_dir.join("costpilot-plugin-aws"));
    }

    #[cfg(unix)]
    #[test]
    fn test_any_executable_fallback_ignores_plain_files() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("v1");
        fs::create_dir_all(&version_dir).unwrap();
        fs::write(version_dir.join("README.md"), "docs").unwrap();
        write_metadata(&version_dir, &HashMap::new()).unwrap();
        assert!(resolver(false).resolve(&version_dir, "aws", None).is_none());

        write_executable(&version_dir, "run");
        assert_eq!(
            resolver(false).resolve(&version_dir, "aws", None).unwrap(),
            version_dir.join("run")
        );
    }

    #[test]
    fn test_corrupt_metadata_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("aws").join("v1.0.0");
        write_executable(&version_dir, "costlens-plugin-aws");
        fs::write(version_dir.join(METADATA_FILE_NAME), "{oops").unwrap();

        let plugins = scanner(dir.path()).list_plugins().unwrap();
        assert_eq!(plugins.len(), 1);
        assert!(plugins[0].metadata.is_none());
    }

    #[test]
    fn test_metadata_is_attached() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("aws").join("v1.0.0");
        write_executable(&version_dir, "costlens-plugin-aws");
        let metadata = HashMap::from([(REGION_KEY.to_string(), "us-west-2".to_string())]);
        write_metadata(&version_dir, &metadata).unwrap();

        let plugins = scanner(dir.path()).list_plugins().unwrap();
        assert_eq!(plugins[0].metadata_value(REGION_KEY), Some("us-west-2"));
    }

    #[test]
    fn test_latest_version_per_plugin() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for version in ["v1.0.0", "v1.10.0", "v1.9.0", "v2.0.0-rc.1"] {
            write_executable(&root.join("aws").join(version), "costlens-plugin-aws");
        }
        write_executable(&root.join("gcp").join("0.1.0"), "gcp");

        let report = scanner(root).list_latest_plugins().unwrap();
        let latest: Vec<(&str, &str)> = report
            .plugins
            .iter()
            .map(|p| (p.name.as_str(), p.version.as_str()))
            .collect();
        assert_eq!(latest, vec![("aws", "v2.0.0-rc.1"), ("gcp", "0.1.0")]);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_invalid_version_is_warning_not_error() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_executable(&root.join("p").join("v1.0.0"), "costlens-plugin-p");
        write_executable(&root.join("p").join("v1.2.0-!!invalid"), "costlens-plugin-p");

        let latest = scanner(root).get_latest_plugin("p").unwrap();
        assert_eq!(latest.plugin.version, "v1.0.0");
        assert_eq!(latest.warnings.len(), 1);
        assert!(latest.warnings[0].to_string().contains("v1.2.0-!!invalid"));

        // 无效版本仍然可以枚举
        assert_eq!(scanner(root).list_plugins().unwrap().len(), 2);
    }

    #[test]
    fn test_get_latest_unknown_plugin() {
        let dir = TempDir::new().unwrap();
        let err = scanner(dir.path()).get_latest_plugin("nope").unwrap_err();
        assert!(matches!(err, RegistryError::PluginNotFound(_)));
    }
}
